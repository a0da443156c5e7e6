use crate::config::PipelineConfig;
use crate::core::masks::SceneMasks;
use crate::io::band_table::BandFileTable;
use crate::io::raster::SceneRaster;
use crate::types::{
    BandCube, BandImage, BoolMask, GridSpec, IceSurfError, IceSurfResult, Sentinel2Band,
};
use ndarray::{Array2, ArrayView2, Axis};

/// Scaled reflectance of the nine feature bands with the scene masks attached
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    /// band x y x x, bands in [`Sentinel2Band::FEATURE_ORDER`]
    pub bands: BandCube,
    pub ice_mask: BoolMask,
    pub cloud_mask: BoolMask,
    pub grid: GridSpec,
}

impl FeatureGrid {
    pub fn new(bands: BandCube, masks: SceneMasks) -> IceSurfResult<Self> {
        let (n_bands, rows, cols) = bands.dim();
        if n_bands != Sentinel2Band::FEATURE_ORDER.len() {
            return Err(IceSurfError::InvalidFormat(format!(
                "Expected {} feature bands, got {}",
                Sentinel2Band::FEATURE_ORDER.len(),
                n_bands
            )));
        }
        IceSurfError::check_shape("feature bands", masks.grid.shape(), (rows, cols))?;

        Ok(Self {
            bands,
            ice_mask: masks.ice,
            cloud_mask: masks.cloud,
            grid: masks.grid,
        })
    }

    /// (rows, cols) of the scene grid
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.bands.dim();
        (rows, cols)
    }

    pub fn band(&self, band: Sentinel2Band) -> ArrayView2<'_, f32> {
        self.bands.index_axis(Axis(0), band.feature_index())
    }

    /// Per-pixel sum of all feature bands
    pub fn band_sum(&self) -> BandImage {
        self.bands.sum_axis(Axis(0))
    }

    /// One row per pixel, one column per band, pixels in row-major order.
    /// With a mask only its pixels are included. Returns the table and the
    /// flat row-major index of each row's pixel.
    pub fn sample_table(&self, mask: Option<&BoolMask>) -> IceSurfResult<(Array2<f32>, Vec<usize>)> {
        let (rows, cols) = self.shape();
        if let Some(mask) = mask {
            IceSurfError::check_shape("sample mask", (rows, cols), mask.dim())?;
        }

        let n_bands = self.bands.len_of(Axis(0));
        let selected: Vec<usize> = match mask {
            Some(mask) => mask
                .iter()
                .enumerate()
                .filter_map(|(i, &keep)| keep.then_some(i))
                .collect(),
            None => (0..rows * cols).collect(),
        };

        let mut values = Vec::with_capacity(selected.len() * n_bands);
        for &index in &selected {
            let (row, col) = (index / cols, index % cols);
            values.extend(self.bands.index_axis(Axis(1), row).column(col).iter().copied());
        }

        let table = Array2::from_shape_vec((selected.len(), n_bands), values).map_err(|e| {
            IceSurfError::Processing(format!("Failed to build sample table: {}", e))
        })?;
        Ok((table, selected))
    }
}

/// Loads and scales the feature bands of a scene
#[derive(Debug, Clone)]
pub struct FeatureAssembler {
    reflectance_scale: f32, // L2A digital number of reflectance 1.0
}

impl Default for FeatureAssembler {
    fn default() -> Self {
        Self {
            reflectance_scale: 10_000.0,
        }
    }
}

impl FeatureAssembler {
    pub fn new(reflectance_scale: f32) -> Self {
        Self { reflectance_scale }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.reflectance_scale)
    }

    /// Read the nine bands of a scene in feature order
    pub fn assemble(&self, bands: &BandFileTable, masks: SceneMasks) -> IceSurfResult<FeatureGrid> {
        let mut raw = Vec::with_capacity(Sentinel2Band::FEATURE_ORDER.len());
        for (band, path) in bands.feature_paths() {
            let (values, grid) = SceneRaster::read_band::<f32, _>(path)?;
            IceSurfError::check_shape(band.id(), masks.grid.shape(), grid.shape())?;
            log::debug!("Loaded {} from {}", band, path.display());
            raw.push(values);
        }

        self.from_raw_bands(raw, masks)
    }

    /// Scale raw digital numbers to reflectance and stack them
    pub fn from_raw_bands(&self, raw: Vec<BandImage>, masks: SceneMasks) -> IceSurfResult<FeatureGrid> {
        if raw.len() != Sentinel2Band::FEATURE_ORDER.len() {
            return Err(IceSurfError::InvalidFormat(format!(
                "Expected {} feature bands, got {}",
                Sentinel2Band::FEATURE_ORDER.len(),
                raw.len()
            )));
        }
        for (band, values) in Sentinel2Band::FEATURE_ORDER.iter().zip(&raw) {
            IceSurfError::check_shape(band.id(), masks.grid.shape(), values.dim())?;
        }

        let scaled: Vec<BandImage> = raw
            .into_iter()
            .map(|b| b.mapv(|v| v / self.reflectance_scale))
            .collect();
        let views: Vec<ArrayView2<f32>> = scaled.iter().map(|b| b.view()).collect();
        let bands = ndarray::stack(Axis(0), &views)
            .map_err(|e| IceSurfError::Processing(format!("Failed to stack bands: {}", e)))?;

        FeatureGrid::new(bands, masks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn masks(rows: usize, cols: usize) -> SceneMasks {
        let grid = GridSpec {
            width: cols,
            height: rows,
            geo_transform: GeoTransform::from_gdal([0.0, 20.0, 0.0, 0.0, 0.0, -20.0]),
            projection: String::new(),
        };
        SceneMasks::new(
            grid,
            Array2::from_elem((rows, cols), true),
            Array2::from_elem((rows, cols), false),
        )
        .unwrap()
    }

    fn raw_bands() -> Vec<BandImage> {
        // band i holds (i + 1) * 1000 plus the flat pixel index
        (0..9)
            .map(|i| {
                Array2::from_shape_fn((2, 3), |(r, c)| ((i + 1) * 1000 + r * 3 + c) as f32)
            })
            .collect()
    }

    #[test]
    fn test_bands_scaled_and_ordered() {
        let features = FeatureAssembler::default()
            .from_raw_bands(raw_bands(), masks(2, 3))
            .unwrap();

        assert_eq!(features.bands.dim(), (9, 2, 3));
        assert_abs_diff_eq!(features.band(Sentinel2Band::B02)[[0, 0]], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(features.band(Sentinel2Band::B12)[[1, 2]], 0.9005, epsilon = 1e-6);
        assert_abs_diff_eq!(features.band_sum()[[0, 0]], 4.5, epsilon = 1e-5);
    }

    #[test]
    fn test_sample_table_row_major() {
        let features = FeatureAssembler::new(1.0)
            .from_raw_bands(raw_bands(), masks(2, 3))
            .unwrap();

        let (table, index) = features.sample_table(None).unwrap();
        assert_eq!(table.dim(), (6, 9));
        assert_eq!(index, vec![0, 1, 2, 3, 4, 5]);
        // pixel (1, 0) is row 3; column j is band j
        assert_eq!(table[[3, 0]], 1003.0);
        assert_eq!(table[[3, 8]], 9003.0);

        let mask = array![[false, true, false], [false, false, true]];
        let (table, index) = features.sample_table(Some(&mask)).unwrap();
        assert_eq!(index, vec![1, 5]);
        assert_eq!(table.row(1).to_vec()[6], 7005.0);
    }

    #[test]
    fn test_band_shape_mismatch() {
        let mut raw = raw_bands();
        raw[4] = Array2::zeros((3, 3));
        assert!(matches!(
            FeatureAssembler::default().from_raw_bands(raw, masks(2, 3)),
            Err(IceSurfError::ShapeMismatch { .. })
        ));

        let raw = raw_bands().into_iter().take(8).collect();
        assert!(FeatureAssembler::default().from_raw_bands(raw, masks(2, 3)).is_err());
    }
}
