/*!
 * Scene quality gate
 *
 * A pixel is unusable when it lies outside the ice mask, under cloud, or
 * carries the no-data value in the reference band. The scene is classified
 * only if the usable share reaches the configured minimum.
 */

use crate::config::PipelineConfig;
use crate::types::{BandImage, BoolMask, IceSurfError, IceSurfResult};
use ndarray::Zip;
use serde::{Deserialize, Serialize};

/// Cover percentages (0-100) of one scene and the gate decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub cloud_cover_pct: f64,
    pub ice_cover_pct: f64,
    pub nan_cover_pct: f64,
    pub useable_area_pct: f64,
    pub passed: bool,
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    minimum_useable_area: f64, // percent of the scene
    nodata_value: f32,         // L2A fill value
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            minimum_useable_area: 40.0,
            nodata_value: 0.0,
        }
    }
}

impl QualityGate {
    pub fn new(minimum_useable_area: f64, nodata_value: f32) -> Self {
        Self {
            minimum_useable_area,
            nodata_value,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(f64::from(config.minimum_useable_area), config.nodata_value)
    }

    fn is_nodata(&self, value: f32) -> bool {
        value.is_nan() || value == self.nodata_value
    }

    /// Cover statistics from the masks and the raw reference band
    pub fn assess(
        &self,
        ice: &BoolMask,
        cloud: &BoolMask,
        reference: &BandImage,
    ) -> IceSurfResult<QualityReport> {
        IceSurfError::check_shape("cloud mask", ice.dim(), cloud.dim())?;
        IceSurfError::check_shape("reference band", ice.dim(), reference.dim())?;

        let total = ice.len();
        if total == 0 {
            log::warn!("Empty scene grid, nothing is useable");
            return Ok(QualityReport {
                cloud_cover_pct: 0.0,
                ice_cover_pct: 0.0,
                nan_cover_pct: 0.0,
                useable_area_pct: 0.0,
                passed: false,
            });
        }

        let mut ice_count = 0usize;
        let mut cloud_count = 0usize;
        let mut nan_count = 0usize;
        let mut bad_count = 0usize;

        Zip::from(ice)
            .and(cloud)
            .and(reference)
            .for_each(|&is_ice, &is_cloud, &value| {
                let nodata = self.is_nodata(value);
                ice_count += usize::from(is_ice);
                cloud_count += usize::from(is_cloud);
                nan_count += usize::from(nodata);
                bad_count += usize::from(!is_ice || is_cloud || nodata);
            });

        let pct = |count: usize| count as f64 * 100.0 / total as f64;
        let useable_area_pct = 100.0 - pct(bad_count);
        let report = QualityReport {
            cloud_cover_pct: pct(cloud_count),
            ice_cover_pct: pct(ice_count),
            nan_cover_pct: pct(nan_count),
            useable_area_pct,
            passed: useable_area_pct >= self.minimum_useable_area,
        };

        log::info!("Quality assessment completed:");
        log::info!("  - Ice cover: {:.1}%", report.ice_cover_pct);
        log::info!("  - Cloud cover: {:.1}%", report.cloud_cover_pct);
        log::info!("  - No-data cover: {:.1}%", report.nan_cover_pct);
        log::info!(
            "  - Useable area: {:.1}% (minimum {:.1}%)",
            report.useable_area_pct,
            self.minimum_useable_area
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, s};

    /// 100 pixel scene with the given numbers of non-ice, cloud and no-data pixels,
    /// each condition on its own pixels
    fn scene(non_ice: usize, cloud: usize, nodata: usize) -> (BoolMask, BoolMask, BandImage) {
        let mut ice = Array2::from_elem((10, 10), true);
        let mut clouds = Array2::from_elem((10, 10), false);
        let mut reference = Array2::from_elem((10, 10), 1200.0f32);

        let flat_ice = ice.as_slice_mut().unwrap();
        flat_ice[..non_ice].iter_mut().for_each(|v| *v = false);
        let flat_cloud = clouds.as_slice_mut().unwrap();
        flat_cloud[non_ice..non_ice + cloud].iter_mut().for_each(|v| *v = true);
        let flat_ref = reference.as_slice_mut().unwrap();
        flat_ref[non_ice + cloud..non_ice + cloud + nodata]
            .iter_mut()
            .for_each(|v| *v = 0.0);

        (ice, clouds, reference)
    }

    #[test]
    fn test_mostly_ice_scene_passes() {
        let (ice, cloud, reference) = scene(20, 5, 2);
        let report = QualityGate::new(40.0, 0.0).assess(&ice, &cloud, &reference).unwrap();

        assert_eq!(report.ice_cover_pct, 80.0);
        assert_eq!(report.cloud_cover_pct, 5.0);
        assert_eq!(report.nan_cover_pct, 2.0);
        assert_eq!(report.useable_area_pct, 73.0);
        assert!(report.passed);
    }

    #[test]
    fn test_little_ice_scene_fails() {
        let (ice, cloud, reference) = scene(90, 5, 2);
        let report = QualityGate::default().assess(&ice, &cloud, &reference).unwrap();

        assert_eq!(report.ice_cover_pct, 10.0);
        assert_eq!(report.useable_area_pct, 3.0);
        assert!(!report.passed);
    }

    #[test]
    fn test_overlapping_conditions_counted_once() {
        let mut ice = Array2::from_elem((2, 2), true);
        let mut cloud = Array2::from_elem((2, 2), false);
        let mut reference = Array2::from_elem((2, 2), 500.0f32);
        ice[[0, 0]] = false;
        cloud[[0, 0]] = true;
        reference[[0, 0]] = 0.0;

        let report = QualityGate::default().assess(&ice, &cloud, &reference).unwrap();
        assert_eq!(report.useable_area_pct, 75.0);
    }

    #[test]
    fn test_threshold_equality_passes() {
        let (ice, cloud, reference) = scene(60, 0, 0);
        let report = QualityGate::new(40.0, 0.0).assess(&ice, &cloud, &reference).unwrap();
        assert_eq!(report.useable_area_pct, 40.0);
        assert!(report.passed);
    }

    #[test]
    fn test_empty_grid_and_shape_mismatch() {
        let empty = Array2::<bool>::from_elem((0, 0), false);
        let report = QualityGate::default()
            .assess(&empty, &empty, &Array2::zeros((0, 0)))
            .unwrap();
        assert_eq!(report.useable_area_pct, 0.0);
        assert!(!report.passed);

        let (ice, cloud, reference) = scene(0, 0, 0);
        let smaller = reference.slice(s![..5, ..]).to_owned();
        assert!(QualityGate::default().assess(&ice, &cloud, &smaller).is_err());
    }
}
