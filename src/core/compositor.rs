/*!
 * Final mask and artifact composition
 *
 * A pixel keeps its class and albedo only when it is ice, not cloud, and has
 * a positive band sum (zero-filled pixels at swath gaps and tile edges).
 */

use crate::core::features::FeatureGrid;
use crate::io::artifact::{ArtifactStore, ClassificationArtifact};
use crate::io::raster::{ProjectionInfo, SceneRaster};
use crate::types::{
    BandImage, BoolMask, ClassGrid, IceSurfError, IceSurfResult, SceneId, UNCLASSIFIED,
};
use ndarray::Zip;
use std::path::{Path, PathBuf};

/// `ice && band_sum > 0 && !cloud`
pub fn final_mask(ice: &BoolMask, cloud: &BoolMask, band_sum: &BandImage) -> IceSurfResult<BoolMask> {
    IceSurfError::check_shape("cloud mask", ice.dim(), cloud.dim())?;
    IceSurfError::check_shape("band sum", ice.dim(), band_sum.dim())?;

    Ok(Zip::from(ice)
        .and(cloud)
        .and(band_sum)
        .map_collect(|&is_ice, &is_cloud, &sum| is_ice && sum > 0.0 && !is_cloud))
}

/// Reset classes to 0 and albedo to NaN outside the mask
pub fn apply_final_mask(
    mask: &BoolMask,
    classified: &mut ClassGrid,
    albedo: &mut BandImage,
) -> IceSurfResult<()> {
    IceSurfError::check_shape("classified grid", mask.dim(), classified.dim())?;
    IceSurfError::check_shape("albedo grid", mask.dim(), albedo.dim())?;

    Zip::from(mask)
        .and(classified)
        .and(albedo)
        .for_each(|&keep, class, value| {
            if !keep {
                *class = UNCLASSIFIED;
                *value = f32::NAN;
            }
        });
    Ok(())
}

/// Assembles and persists the classification artifact of a scene
pub struct Compositor {
    output_dir: PathBuf,
}

impl Compositor {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
        }
    }

    /// Mask the class and albedo grids, attach georeferencing and write the
    /// artifact. Returns the artifact path.
    pub fn compose(
        &self,
        scene: &SceneId,
        features: &FeatureGrid,
        final_mask: BoolMask,
        mut classified: ClassGrid,
        mut albedo: BandImage,
    ) -> IceSurfResult<PathBuf> {
        apply_final_mask(&final_mask, &mut classified, &mut albedo)?;

        let grid = features.grid.clone();
        let projection = ProjectionInfo::from_wkt(&grid.projection)?;
        let (longitude, latitude) = SceneRaster::lon_lat(&grid)?;
        log::debug!(
            "Scene CRS {} ({})",
            projection.projected_crs_name,
            projection.grid_mapping_name
        );

        let artifact = ClassificationArtifact {
            scene: scene.clone(),
            grid,
            classified,
            albedo,
            ice_mask: features.ice_mask.clone(),
            cloud_mask: features.cloud_mask.clone(),
            final_mask,
            projection,
            longitude,
            latitude,
        };

        ArtifactStore::write(&artifact, &self.output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_final_mask_requires_ice_data_and_clear_sky() {
        let ice = array![[true, true, true, false]];
        let cloud = array![[false, true, false, false]];
        let band_sum = array![[2.1f32, 2.1, 0.0, 2.1]];

        let mask = final_mask(&ice, &cloud, &band_sum).unwrap();
        assert_eq!(mask, array![[true, false, false, false]]);
    }

    #[test]
    fn test_final_mask_implies_ice() {
        let ice = Array2::from_shape_fn((5, 5), |(r, c)| (r * 5 + c) % 3 != 0);
        let cloud = Array2::from_shape_fn((5, 5), |(r, c)| (r + c) % 4 == 0);
        let band_sum = Array2::from_shape_fn((5, 5), |(r, _)| r as f32);

        let mask = final_mask(&ice, &cloud, &band_sum).unwrap();
        Zip::from(&mask).and(&ice).for_each(|&m, &i| assert!(!m || i));
    }

    #[test]
    fn test_apply_final_mask_sets_sentinels() {
        let mask = array![[true, false]];
        let mut classified = array![[4u8, 6]];
        let mut albedo = array![[0.4f32, 0.2]];

        apply_final_mask(&mask, &mut classified, &mut albedo).unwrap();
        assert_eq!(classified, array![[4u8, 0]]);
        assert_eq!(albedo[[0, 0]], 0.4);
        assert!(albedo[[0, 1]].is_nan());

        let mut short = array![[1u8]];
        assert!(apply_final_mask(&mask, &mut short, &mut albedo).is_err());
    }
}
