/*!
 * Broadband albedo from Sentinel-2 surface reflectance
 *
 * Linear narrowband-to-broadband conversion after Liang et al. (2002) over the
 * blue, red, narrow NIR and two SWIR bands.
 */

use crate::core::features::FeatureGrid;
use crate::types::{BandImage, IceSurfError, IceSurfResult, Sentinel2Band};
use ndarray::{ArrayView2, Zip};

const W_B02: f32 = 0.356;
const W_B04: f32 = 0.130;
const W_B8A: f32 = 0.373;
const W_B11: f32 = 0.085;
const W_B12: f32 = 0.072;
const OFFSET: f32 = -0.0018;

/// Albedo of every pixel; inputs are reflectance (0-1) on the same grid
pub fn narrowband_to_broadband<'a>(
    b02: ArrayView2<'a, f32>,
    b04: ArrayView2<'a, f32>,
    b8a: ArrayView2<'a, f32>,
    b11: ArrayView2<'a, f32>,
    b12: ArrayView2<'a, f32>,
) -> IceSurfResult<BandImage> {
    let shape = b02.dim();
    for (name, band) in [("B04", &b04), ("B8A", &b8a), ("B11", &b11), ("B12", &b12)] {
        IceSurfError::check_shape(name, shape, band.dim())?;
    }

    Ok(Zip::from(&b02)
        .and(&b04)
        .and(&b8a)
        .and(&b11)
        .and(&b12)
        .map_collect(|&blue, &red, &nir, &swir1, &swir2| {
            W_B02 * blue + W_B04 * red + W_B8A * nir + W_B11 * swir1 + W_B12 * swir2 + OFFSET
        }))
}

/// Albedo of a scene's feature grid
pub fn albedo_from_features(features: &FeatureGrid) -> IceSurfResult<BandImage> {
    narrowband_to_broadband(
        features.band(Sentinel2Band::B02),
        features.band(Sentinel2Band::B04),
        features.band(Sentinel2Band::B8A),
        features.band(Sentinel2Band::B11),
        features.band(Sentinel2Band::B12),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_weights_applied_per_band() {
        let zero = Array2::<f32>::zeros((1, 2));
        let one = Array2::<f32>::ones((1, 2));

        let albedo =
            narrowband_to_broadband(one.view(), zero.view(), zero.view(), zero.view(), zero.view())
                .unwrap();
        assert_abs_diff_eq!(albedo[[0, 1]], 0.3542, epsilon = 1e-6);

        let albedo =
            narrowband_to_broadband(zero.view(), zero.view(), zero.view(), zero.view(), one.view())
                .unwrap();
        assert_abs_diff_eq!(albedo[[0, 0]], 0.0702, epsilon = 1e-6);
    }

    #[test]
    fn test_uniform_reflectance() {
        // the weights sum to 1.016
        let r = array![[0.5f32, 0.8]];
        let albedo =
            narrowband_to_broadband(r.view(), r.view(), r.view(), r.view(), r.view()).unwrap();
        assert_abs_diff_eq!(albedo[[0, 0]], 0.5062, epsilon = 1e-5);
        assert_abs_diff_eq!(albedo[[0, 1]], 0.8110, epsilon = 1e-5);
    }

    #[test]
    fn test_nan_propagates_and_shapes_checked() {
        let r = array![[0.5f32, f32::NAN]];
        let albedo =
            narrowband_to_broadband(r.view(), r.view(), r.view(), r.view(), r.view()).unwrap();
        assert!(albedo[[0, 1]].is_nan());

        let other = Array2::<f32>::zeros((2, 1));
        assert!(matches!(
            narrowband_to_broadband(r.view(), r.view(), other.view(), r.view(), r.view()),
            Err(IceSurfError::ShapeMismatch { .. })
        ));
    }
}
