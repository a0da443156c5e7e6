use chrono::NaiveDate;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Scaled surface reflectance (0-1)
pub type Reflectance = f32;

/// 2D single-band raster (y x x)
pub type BandImage = Array2<f32>;

/// 3D multi-band stack (band x y x x)
pub type BandCube = Array3<Reflectance>;

/// Boolean raster mask (true = condition holds)
pub type BoolMask = Array2<bool>;

/// Per-pixel surface class labels (0 = unclassified)
pub type ClassGrid = Array2<u8>;

/// Label written wherever a pixel is outside the final validity mask
pub const UNCLASSIFIED: u8 = 0;

/// Sentinel-2 MSI bands delivered in the 20 m L2A product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sentinel2Band {
    B02,
    B03,
    B04,
    B05,
    B06,
    B07,
    B8A,
    B11,
    B12,
}

impl Sentinel2Band {
    /// Feature order used when the classifier was trained. Row layout of every
    /// sample table must follow this order exactly.
    pub const FEATURE_ORDER: [Sentinel2Band; 9] = [
        Sentinel2Band::B02,
        Sentinel2Band::B03,
        Sentinel2Band::B04,
        Sentinel2Band::B05,
        Sentinel2Band::B06,
        Sentinel2Band::B07,
        Sentinel2Band::B8A,
        Sentinel2Band::B11,
        Sentinel2Band::B12,
    ];

    /// Band whose grid defines the scene grid and whose values flag no-data
    pub const REFERENCE: Sentinel2Band = Sentinel2Band::B02;

    /// Band identifier as it appears in L2A file names
    pub fn id(&self) -> &'static str {
        match self {
            Sentinel2Band::B02 => "B02",
            Sentinel2Band::B03 => "B03",
            Sentinel2Band::B04 => "B04",
            Sentinel2Band::B05 => "B05",
            Sentinel2Band::B06 => "B06",
            Sentinel2Band::B07 => "B07",
            Sentinel2Band::B8A => "B8A",
            Sentinel2Band::B11 => "B11",
            Sentinel2Band::B12 => "B12",
        }
    }

    /// Position of the band in [`Sentinel2Band::FEATURE_ORDER`]
    pub fn feature_index(&self) -> usize {
        Self::FEATURE_ORDER
            .iter()
            .position(|b| b == self)
            .unwrap_or_default()
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::FEATURE_ORDER
            .iter()
            .copied()
            .find(|b| b.id().eq_ignore_ascii_case(id))
    }
}

impl std::fmt::Display for Sentinel2Band {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Ice surface classes predicted by the random forest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurfaceClass {
    Snow = 1,
    Water = 2,
    Cryoconite = 3,
    CleanIce = 4,
    LightAlgae = 5,
    HeavyAlgae = 6,
}

impl SurfaceClass {
    pub const ALL: [SurfaceClass; 6] = [
        SurfaceClass::Snow,
        SurfaceClass::Water,
        SurfaceClass::Cryoconite,
        SurfaceClass::CleanIce,
        SurfaceClass::LightAlgae,
        SurfaceClass::HeavyAlgae,
    ];

    pub fn label(&self) -> u8 {
        *self as u8
    }

    pub fn from_label(label: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.label() == label)
    }

    /// Short identifier used for the `classID` coordinate of summary files
    pub fn abbreviation(&self) -> &'static str {
        match self {
            SurfaceClass::Snow => "SN",
            SurfaceClass::Water => "WAT",
            SurfaceClass::Cryoconite => "CC",
            SurfaceClass::CleanIce => "CI",
            SurfaceClass::LightAlgae => "LA",
            SurfaceClass::HeavyAlgae => "HA",
        }
    }

    /// Row index in a summary table
    pub fn index(&self) -> usize {
        self.label() as usize - 1
    }

    /// `key` attribute attached to classified grids
    pub fn legend() -> String {
        Self::ALL
            .iter()
            .map(|c| format!("{}:{}", c, c.label()))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl std::fmt::Display for SurfaceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SurfaceClass::Snow => write!(f, "Snow"),
            SurfaceClass::Water => write!(f, "Water"),
            SurfaceClass::Cryoconite => write!(f, "Cryoconite"),
            SurfaceClass::CleanIce => write!(f, "Clean Ice"),
            SurfaceClass::LightAlgae => write!(f, "Light Algae"),
            SurfaceClass::HeavyAlgae => write!(f, "Heavy Algae"),
        }
    }
}

/// One Sentinel-2 overpass of one tile
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneId {
    pub tile: String,
    pub date: NaiveDate,
}

impl SceneId {
    pub fn new(tile: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            tile: tile.into(),
            date,
        }
    }

    /// Date as it is encoded in product and output file names
    pub fn compact_date(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}

impl std::fmt::Display for SceneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.tile, self.compact_date())
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of the centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (
            self.top_left_x + c * self.pixel_width + r * self.rotation_x,
            self.top_left_y + c * self.rotation_y + r * self.pixel_height,
        )
    }
}

/// Pixel grid of a scene: size, affine transform and projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub geo_transform: GeoTransform,
    /// Projection as WKT
    pub projection: String,
}

impl GridSpec {
    /// Array shape (rows, cols) of rasters on this grid
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Error types for the classification pipeline
#[derive(Debug, thiserror::Error)]
pub enum IceSurfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("NetCDF error: {0}")]
    NetCdf(#[from] netcdf::error::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("No file found for band {0}")]
    MissingBand(String),

    #[error("Band {band} matches {} files: {candidates:?}", .candidates.len())]
    AmbiguousBand {
        band: String,
        candidates: Vec<PathBuf>,
    },

    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl IceSurfError {
    pub(crate) fn check_shape(
        what: &str,
        expected: (usize, usize),
        found: (usize, usize),
    ) -> IceSurfResult<()> {
        if expected == found {
            Ok(())
        } else {
            Err(IceSurfError::ShapeMismatch {
                what: what.to_string(),
                expected,
                found,
            })
        }
    }
}

/// Result type for pipeline operations
pub type IceSurfResult<T> = Result<T, IceSurfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_order_indices() {
        for (i, band) in Sentinel2Band::FEATURE_ORDER.iter().enumerate() {
            assert_eq!(band.feature_index(), i);
        }
        assert_eq!(Sentinel2Band::from_id("b8a"), Some(Sentinel2Band::B8A));
        assert_eq!(Sentinel2Band::from_id("B01"), None);
    }

    #[test]
    fn test_surface_class_legend() {
        assert_eq!(
            SurfaceClass::legend(),
            "Snow:1; Water:2; Cryoconite:3; Clean Ice:4; Light Algae:5; Heavy Algae:6"
        );
        assert_eq!(SurfaceClass::from_label(3), Some(SurfaceClass::Cryoconite));
        assert_eq!(SurfaceClass::from_label(0), None);
        assert_eq!(SurfaceClass::HeavyAlgae.index(), 5);
    }

    #[test]
    fn test_scene_id_display() {
        let scene = SceneId::new("22wev", NaiveDate::from_ymd_opt(2017, 6, 5).unwrap());
        assert_eq!(scene.to_string(), "22wev_20170605");
    }

    #[test]
    fn test_pixel_center() {
        let gt = GeoTransform::from_gdal([500000.0, 20.0, 0.0, 7600000.0, 0.0, -20.0]);
        assert_eq!(gt.pixel_center(0, 0), (500010.0, 7599990.0));
        assert_eq!(gt.pixel_center(2, 1), (500030.0, 7599950.0));
        assert_eq!(gt.to_gdal()[5], -20.0);
    }
}
