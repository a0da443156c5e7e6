/*!
 * Ice and cloud masks on the scene grid
 *
 * The static land/ice mask is reprojected onto the grid of the reference band
 * with nearest-neighbour resampling; the cloud mask thresholds the L2A cloud
 * probability layer.
 */

use crate::config::PipelineConfig;
use crate::io::band_table::BandFileTable;
use crate::io::raster::SceneRaster;
use crate::types::{BandImage, BoolMask, GridSpec, IceSurfError, IceSurfResult};
use std::path::{Path, PathBuf};

/// Cloud wherever the probability (0-100) reaches the threshold
pub fn cloud_mask_from_probability(probability: &BandImage, threshold: f32) -> BoolMask {
    probability.mapv(|p| p >= threshold)
}

/// Masks of one scene, both on `grid`
#[derive(Debug, Clone)]
pub struct SceneMasks {
    pub grid: GridSpec,
    pub ice: BoolMask,
    pub cloud: BoolMask,
}

impl SceneMasks {
    pub fn new(grid: GridSpec, ice: BoolMask, cloud: BoolMask) -> IceSurfResult<Self> {
        IceSurfError::check_shape("ice mask", grid.shape(), ice.dim())?;
        IceSurfError::check_shape("cloud mask", grid.shape(), cloud.dim())?;
        Ok(Self { grid, ice, cloud })
    }
}

/// Builds scene masks; the reprojected ice mask is reused while the scene
/// grid stays the same
pub struct MaskBuilder {
    ice_mask_path: PathBuf,
    cloud_prob_threshold: f32,
    reprojected_mask_path: Option<PathBuf>,
    cache: Option<(GridSpec, BoolMask)>,
}

impl MaskBuilder {
    pub fn new<P: AsRef<Path>>(ice_mask_path: P, cloud_prob_threshold: f32) -> Self {
        Self {
            ice_mask_path: ice_mask_path.as_ref().to_path_buf(),
            cloud_prob_threshold,
            reprojected_mask_path: None,
            cache: None,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.ice_mask_path, config.cloud_prob_threshold)
            .with_reprojected_output(config.reprojected_mask_path.clone())
    }

    /// Also save every freshly reprojected ice mask as a GeoTIFF
    pub fn with_reprojected_output(mut self, path: Option<PathBuf>) -> Self {
        self.reprojected_mask_path = path;
        self
    }

    /// Ice mask on `grid`, reprojecting only when the grid differs from the
    /// previous call
    pub fn ice_mask_for(&mut self, grid: &GridSpec) -> IceSurfResult<BoolMask> {
        if let Some((cached_grid, mask)) = &self.cache {
            if cached_grid == grid {
                log::debug!("Reusing reprojected ice mask");
                return Ok(mask.clone());
            }
        }

        let mask = SceneRaster::reproject_mask(&self.ice_mask_path, grid)?;
        IceSurfError::check_shape("reprojected ice mask", grid.shape(), mask.dim())?;

        if let Some(path) = &self.reprojected_mask_path {
            SceneRaster::write_mask(&mask, grid, path)?;
            log::info!("Saved reprojected ice mask to {}", path.display());
        }

        self.cache = Some((grid.clone(), mask.clone()));
        Ok(mask)
    }

    /// Ice and cloud masks on the grid of the scene's reference band
    pub fn build(&mut self, bands: &BandFileTable) -> IceSurfResult<SceneMasks> {
        let grid = SceneRaster::grid_spec(bands.reference())?;
        log::debug!(
            "Scene grid {} x {}, origin ({}, {})",
            grid.width,
            grid.height,
            grid.geo_transform.top_left_x,
            grid.geo_transform.top_left_y
        );

        let ice = self.ice_mask_for(&grid)?;

        let (probability, cloud_grid) = SceneRaster::read_band::<f32, _>(bands.cloud_layer())?;
        IceSurfError::check_shape("cloud probability", grid.shape(), cloud_grid.shape())?;
        let cloud = cloud_mask_from_probability(&probability, self.cloud_prob_threshold);

        SceneMasks::new(grid, ice, cloud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::array;

    #[test]
    fn test_cloud_threshold_is_inclusive() {
        let probability = array![[0.0f32, 49.9, 50.0], [50.1, 100.0, f32::NAN]];
        let mask = cloud_mask_from_probability(&probability, 50.0);
        assert_eq!(mask, array![[false, false, true], [true, true, false]]);
    }

    #[test]
    fn test_scene_masks_shape_checked() {
        let grid = GridSpec {
            width: 2,
            height: 1,
            geo_transform: GeoTransform::from_gdal([0.0, 20.0, 0.0, 0.0, 0.0, -20.0]),
            projection: String::new(),
        };
        assert!(SceneMasks::new(grid.clone(), array![[true, false]], array![[false, false]]).is_ok());
        assert!(matches!(
            SceneMasks::new(grid, array![[true], [false]], array![[false, false]]),
            Err(IceSurfError::ShapeMismatch { .. })
        ));
    }
}
