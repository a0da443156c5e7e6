//! Run configuration: tiles, dates, thresholds, storage and file locations.

use crate::types::{IceSurfError, IceSurfResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where scene files are fetched from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Azure Blob Storage, one container per tile
    Azure {
        account_name: String,
        /// Prepended to the tile ID to form the container name
        #[serde(default)]
        container_prefix: String,
        /// Shared access signature, without the leading '?'
        #[serde(default)]
        sas_token: Option<String>,
        /// Base64 storage account key; requests are then signed with Shared Key
        #[serde(default)]
        account_key: Option<String>,
        /// Overrides `https://{account}.blob.core.windows.net`
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// Local mirror, one sub-directory per tile
    Local { root: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            root: PathBuf::from("blobs"),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tiles to process, in order
    pub tiles: Vec<String>,
    /// Overpass dates to process for every tile, in order
    #[serde(with = "compact_dates")]
    pub dates: Vec<NaiveDate>,
    /// Cloud probability (0-100) at or above which a pixel is cloud
    pub cloud_prob_threshold: f32,
    /// Minimum share (0-100) of useable pixels for a scene to be classified
    pub minimum_useable_area: f32,
    /// Reference band value marking pixels with no data
    pub nodata_value: f32,
    /// Divisor converting L2A digital numbers to reflectance
    pub reflectance_scale: f32,
    /// Processing level tag preceding the date in product names
    pub product_tag: String,
    /// Suffix identifying 20 m JPEG2000 band files
    pub resolution_suffix: String,
    pub storage: StorageConfig,
    /// Scratch directory for downloaded scene files; they are removed between dates
    pub scratch_path: PathBuf,
    pub output_path: PathBuf,
    /// Random forest exported as JSON
    pub classifier_path: PathBuf,
    /// Static land/ice mask raster
    pub ice_mask_path: PathBuf,
    /// Optional GeoTIFF copy of the ice mask on the current scene grid
    pub reprojected_mask_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let scratch_path = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("icesurf")
            .join("scratch");

        Self {
            tiles: Vec::new(),
            dates: Vec::new(),
            cloud_prob_threshold: 50.0,
            minimum_useable_area: 40.0,
            nodata_value: 0.0,
            reflectance_scale: 10_000.0,
            product_tag: "L2A".to_string(),
            resolution_suffix: "_20m.jp2".to_string(),
            storage: StorageConfig::default(),
            scratch_path,
            output_path: PathBuf::from("outputs"),
            classifier_path: PathBuf::from("Sentinel2_classifier.json"),
            ice_mask_path: PathBuf::from("merged_mask.tif"),
            reprojected_mask_path: None,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> IceSurfResult<Self> {
        log::info!("Reading configuration: {}", path.as_ref().display());

        let content = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> IceSurfResult<()> {
        if self.tiles.is_empty() {
            return Err(IceSurfError::Config("No tiles configured".to_string()));
        }
        if self.dates.is_empty() {
            return Err(IceSurfError::Config("No dates configured".to_string()));
        }
        if let Some(tile) = self.tiles.iter().find(|t| t.trim().is_empty()) {
            return Err(IceSurfError::Config(format!("Invalid tile ID '{}'", tile)));
        }
        if !(0.0..=100.0).contains(&self.cloud_prob_threshold) {
            return Err(IceSurfError::Config(format!(
                "cloud_prob_threshold must be within 0-100, got {}",
                self.cloud_prob_threshold
            )));
        }
        if !(0.0..=100.0).contains(&self.minimum_useable_area) {
            return Err(IceSurfError::Config(format!(
                "minimum_useable_area must be within 0-100, got {}",
                self.minimum_useable_area
            )));
        }
        if !(self.reflectance_scale > 0.0) {
            return Err(IceSurfError::Config(format!(
                "reflectance_scale must be positive, got {}",
                self.reflectance_scale
            )));
        }
        if self.scratch_path.starts_with(&self.output_path)
            || self.output_path.starts_with(&self.scratch_path)
        {
            return Err(IceSurfError::Config(format!(
                "scratch_path {} and output_path {} must not contain one another",
                self.scratch_path.display(),
                self.output_path.display()
            )));
        }

        Ok(())
    }

    /// Output directory of one tile
    pub fn tile_output_dir(&self, tile: &str) -> PathBuf {
        self.output_path.join(tile)
    }
}

/// Dates serialised as `YYYYMMDD`; `YYYY-MM-DD` is accepted on input
pub mod compact_dates {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(s, "%Y%m%d")
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
            .ok()
    }

    pub fn serialize<S>(dates: &[NaiveDate], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(dates.iter().map(|d| d.format("%Y%m%d").to_string()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| {
                parse(s).ok_or_else(|| serde::de::Error::custom(format!("invalid date '{}'", s)))
            })
            .collect()
    }
}
