use crate::config::PipelineConfig;
use crate::io::blob_store::BlobStore;
use crate::types::{IceSurfError, IceSurfResult, SceneId};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Distinct spectral band files a complete 20 m scene delivers
pub const REQUIRED_BAND_FILES: usize = 9;

/// Identifier of the cloud-probability layer in lookup errors
pub const CLOUD_LAYER_ID: &str = "CLD";

/// File name patterns of L2A band and cloud-probability files
#[derive(Debug, Clone)]
pub struct FileNamePatterns {
    band: Regex,
    cloud: Regex,
    suffix: String,
}

impl FileNamePatterns {
    pub fn new(resolution_suffix: &str) -> IceSurfResult<Self> {
        let suffix = regex::escape(resolution_suffix);
        let band = Regex::new(&format!(r"_(B[0-9]{{2}}|B8A){}$", suffix))
            .map_err(|e| IceSurfError::Config(format!("Invalid resolution suffix: {}", e)))?;
        let cloud = Regex::new(&format!(r"CLD{}$", suffix))
            .map_err(|e| IceSurfError::Config(format!("Invalid resolution suffix: {}", e)))?;

        Ok(Self {
            band,
            cloud,
            suffix: resolution_suffix.to_string(),
        })
    }

    /// Band identifier encoded in a file name, e.g. `B8A`
    pub fn band_id<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        self.band
            .captures(file_name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    pub fn is_cloud_layer(&self, file_name: &str) -> bool {
        self.cloud.is_match(file_name)
    }

    /// Any file of the configured resolution, band or not
    pub fn is_scene_file(&self, file_name: &str) -> bool {
        file_name.ends_with(&self.suffix)
    }
}

/// Result of fetching one scene
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionOutcome {
    pub scene: SceneId,
    /// Blob names that passed the date and resolution filter
    pub blobs: Vec<String>,
    /// Local copies in the scratch directory
    pub local_files: Vec<PathBuf>,
    /// Distinct band identifiers found among the local copies
    pub band_ids: BTreeSet<String>,
    pub has_cloud_layer: bool,
}

impl AcquisitionOutcome {
    pub fn is_complete(&self) -> bool {
        self.band_ids.len() >= REQUIRED_BAND_FILES && self.has_cloud_layer
    }

    /// Why the scene cannot be processed, if it cannot
    pub fn incomplete_reason(&self) -> Option<String> {
        if self.is_complete() {
            return None;
        }

        let mut reasons = Vec::new();
        if self.band_ids.len() < REQUIRED_BAND_FILES {
            reasons.push(format!(
                "found {} of {} band files",
                self.band_ids.len(),
                REQUIRED_BAND_FILES
            ));
        }
        if !self.has_cloud_layer {
            reasons.push("cloud probability layer missing".to_string());
        }
        Some(reasons.join("; "))
    }
}

/// Selects and downloads the files of one scene
pub struct AcquisitionGate {
    product_tag: String,
    resolution_suffix: String,
    scratch_dir: PathBuf,
    patterns: FileNamePatterns,
}

impl AcquisitionGate {
    pub fn new(
        product_tag: &str,
        resolution_suffix: &str,
        scratch_dir: &Path,
    ) -> IceSurfResult<Self> {
        Ok(Self {
            product_tag: product_tag.to_string(),
            resolution_suffix: resolution_suffix.to_string(),
            scratch_dir: scratch_dir.to_path_buf(),
            patterns: FileNamePatterns::new(resolution_suffix)?,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> IceSurfResult<Self> {
        Self::new(
            &config.product_tag,
            &config.resolution_suffix,
            &config.scratch_path,
        )
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn patterns(&self) -> &FileNamePatterns {
        &self.patterns
    }

    /// Substring every blob of a scene carries, e.g. `L2A_20170605`
    pub fn product_date_tag(&self, scene: &SceneId) -> String {
        format!("{}_{}", self.product_tag, scene.compact_date())
    }

    /// Blob names belonging to the scene's product at the configured resolution
    pub fn select_blobs(&self, names: &[String], scene: &SceneId) -> Vec<String> {
        let date_tag = self.product_date_tag(scene);
        names
            .iter()
            .filter(|n| n.contains(&self.resolution_suffix) && n.contains(&date_tag))
            .cloned()
            .collect()
    }

    /// List, filter and fetch the scene's files into the scratch directory.
    ///
    /// Incompleteness is reported through the outcome, not as an error; storage
    /// failures are errors.
    pub fn acquire(&self, store: &dyn BlobStore, scene: &SceneId) -> IceSurfResult<AcquisitionOutcome> {
        log::info!("Acquiring scene {}", scene);

        self.clear_scratch()?;

        let names = store.list_blobs(&scene.tile)?;
        let blobs = self.select_blobs(&names, scene);
        log::info!("{} of {} blobs match {}", blobs.len(), names.len(), scene);

        let destinations = self.destinations(&blobs)?;
        let mut local_files = Vec::with_capacity(blobs.len());
        for (name, dest) in blobs.iter().zip(destinations) {
            store.fetch_blob(&scene.tile, name, &dest)?;
            local_files.push(dest);
        }

        let (band_ids, has_cloud_layer) = self.inventory(&self.scratch_dir)?;
        let outcome = AcquisitionOutcome {
            scene: scene.clone(),
            blobs,
            local_files,
            band_ids,
            has_cloud_layer,
        };

        match outcome.incomplete_reason() {
            Some(reason) => log::warn!("Scene {} incomplete: {}", scene, reason),
            None => log::info!("Scene {} complete", scene),
        }

        Ok(outcome)
    }

    /// Scratch path of every selected blob. Two blobs that would land on the
    /// same file name are an error rather than a silent overwrite.
    fn destinations(&self, blobs: &[String]) -> IceSurfResult<Vec<PathBuf>> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        let mut destinations = Vec::with_capacity(blobs.len());

        for name in blobs {
            let file_name = name.rsplit('/').next().unwrap_or(name.as_str());
            if let Some(previous) = seen.insert(file_name, name.as_str()) {
                let candidates = vec![PathBuf::from(previous), PathBuf::from(name)];
                let band = match self.patterns.band_id(file_name) {
                    Some(id) => id.to_string(),
                    None if self.patterns.is_cloud_layer(file_name) => CLOUD_LAYER_ID.to_string(),
                    None => {
                        return Err(IceSurfError::Storage(format!(
                            "Blobs {} and {} share the file name {}",
                            previous, name, file_name
                        )))
                    }
                };
                return Err(IceSurfError::AmbiguousBand { band, candidates });
            }
            destinations.push(self.scratch_dir.join(file_name));
        }

        Ok(destinations)
    }

    /// Remove the scene files left in the scratch directory, creating it if
    /// absent. Files of any other kind are left alone. Returns the number of
    /// files removed.
    pub fn clear_scratch(&self) -> IceSurfResult<usize> {
        let dir = &self.scratch_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            return Ok(0);
        }

        let mut removed = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_file() && self.patterns.is_scene_file(&name) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        if removed > 0 {
            log::debug!("Removed {} files from {}", removed, dir.display());
        }
        Ok(removed)
    }

    /// Band identifiers and cloud layer presence among the files of a directory
    fn inventory(&self, dir: &Path) -> IceSurfResult<(BTreeSet<String>, bool)> {
        let mut band_ids = BTreeSet::new();
        let mut has_cloud_layer = false;

        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(id) = self.patterns.band_id(&name) {
                band_ids.insert(id.to_string());
            }
            if self.patterns.is_cloud_layer(&name) {
                has_cloud_layer = true;
            }
        }

        Ok((band_ids, has_cloud_layer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::blob_store::LocalBlobStore;
    use chrono::NaiveDate;

    const BANDS: [&str; 9] = ["B02", "B03", "B04", "B05", "B06", "B07", "B8A", "B11", "B12"];

    fn scene() -> SceneId {
        SceneId::new("22wev", NaiveDate::from_ymd_opt(2017, 6, 5).unwrap())
    }

    fn granule_dir(root: &Path, date: &str) -> PathBuf {
        root.join("22wev")
            .join(format!("S2A_MSIL2A_{}T151911_N0205_R068_T22WEV.SAFE", date))
            .join("GRANULE")
            .join("IMG_DATA")
    }

    fn write_container(root: &Path, bands: &[&str], cloud: bool) {
        let granule = granule_dir(root, "20170605");
        let other = granule_dir(root, "20170610");
        std::fs::create_dir_all(&granule).unwrap();
        std::fs::create_dir_all(&other).unwrap();
        for band in bands {
            let name = format!("L2A_T22WEV_20170605T151911_{}_20m.jp2", band);
            std::fs::write(granule.join(name), b"jp2").unwrap();
        }
        if cloud {
            std::fs::write(granule.join("L2A_T22WEV_20170605T151911_CLD_20m.jp2"), b"jp2").unwrap();
        }
        // other dates and resolutions are ignored
        std::fs::write(other.join("L2A_T22WEV_20170610T151911_B02_20m.jp2"), b"jp2").unwrap();
        std::fs::write(granule.join("L2A_T22WEV_20170605T151911_B02_10m.jp2"), b"jp2").unwrap();
    }

    #[test]
    fn test_patterns() {
        let patterns = FileNamePatterns::new("_20m.jp2").unwrap();
        assert_eq!(patterns.band_id("L2A_T22WEV_20170605_B8A_20m.jp2"), Some("B8A"));
        assert_eq!(patterns.band_id("L2A_T22WEV_20170605_B11_20m.jp2"), Some("B11"));
        assert_eq!(patterns.band_id("L2A_T22WEV_20170605_SCL_20m.jp2"), None);
        assert_eq!(patterns.band_id("L2A_T22WEV_20170605_B02_10m.jp2"), None);
        assert!(patterns.is_cloud_layer("L2A_T22WEV_20170605_CLD_20m.jp2"));
        assert!(!patterns.is_cloud_layer("L2A_T22WEV_20170605_CLD_60m.jp2"));
    }

    #[test]
    fn test_select_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let gate = AcquisitionGate::new("L2A", "_20m.jp2", dir.path()).unwrap();
        let names = vec![
            "S2A_MSIL2A_20170605T1.SAFE/L2A_T22WEV_B02_20m.jp2".to_string(),
            "S2A_MSIL2A_20170605T1.SAFE/L2A_T22WEV_B02_10m.jp2".to_string(),
            "S2A_MSIL1C_20170605T1.SAFE/L1C_T22WEV_B02_20m.jp2".to_string(),
            "S2A_MSIL2A_20170606T1.SAFE/L2A_T22WEV_B02_20m.jp2".to_string(),
        ];
        assert_eq!(gate.select_blobs(&names, &scene()), vec![names[0].clone()]);
    }

    #[test]
    fn test_complete_scene() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_container(root.path(), &BANDS, true);

        let store = LocalBlobStore::new(root.path());
        let gate = AcquisitionGate::new("L2A", "_20m.jp2", scratch.path()).unwrap();
        let outcome = gate.acquire(&store, &scene()).unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.blobs.len(), 10);
        assert_eq!(outcome.local_files.len(), 10);
        assert!(outcome.local_files.iter().all(|p| p.parent() == Some(scratch.path())));
        assert_eq!(outcome.incomplete_reason(), None);
    }

    #[test]
    fn test_missing_bands_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_container(root.path(), &BANDS[..7], true);

        let store = LocalBlobStore::new(root.path());
        let gate = AcquisitionGate::new("L2A", "_20m.jp2", scratch.path()).unwrap();
        let outcome = gate.acquire(&store, &scene()).unwrap();

        assert!(!outcome.is_complete());
        assert_eq!(outcome.blobs.len(), 8);
        assert!(outcome.incomplete_reason().unwrap().contains("7 of 9"));
    }

    #[test]
    fn test_missing_cloud_layer() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_container(root.path(), &BANDS, false);

        let store = LocalBlobStore::new(root.path());
        let gate = AcquisitionGate::new("L2A", "_20m.jp2", scratch.path()).unwrap();
        let outcome = gate.acquire(&store, &scene()).unwrap();

        assert!(!outcome.is_complete());
        assert!(outcome.incomplete_reason().unwrap().contains("cloud"));
    }

    #[test]
    fn test_clear_scratch_removes_only_scene_files() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let gate = AcquisitionGate::new("L2A", "_20m.jp2", &scratch).unwrap();
        assert_eq!(gate.clear_scratch().unwrap(), 0);
        assert!(scratch.is_dir());

        std::fs::write(scratch.join("L2A_T22WEV_20170605T151911_B02_20m.jp2"), b"x").unwrap();
        std::fs::write(scratch.join("L2A_T22WEV_20170605T151911_CLD_20m.jp2"), b"x").unwrap();
        std::fs::write(scratch.join("L2A_T22WEV_20170605T151911_SCL_20m.jp2"), b"x").unwrap();
        // a scratch path pointed at an output directory keeps its artifacts
        let kept = [
            "22wev_20170605_Classification_and_Albedo_Data.nc",
            "summary_data_22wev_20170605.nc",
            "notes.txt",
        ];
        for name in kept {
            std::fs::write(scratch.join(name), b"x").unwrap();
        }

        assert_eq!(gate.clear_scratch().unwrap(), 3);
        let mut remaining: Vec<String> = std::fs::read_dir(&scratch)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![kept[0], kept[2], kept[1]]);
    }

    #[test]
    fn test_duplicate_file_names_are_ambiguous() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        write_container(root.path(), &BANDS, true);

        // a second processing baseline of the same date repeats the B05 file name
        let baseline = root
            .path()
            .join("22wev")
            .join("S2A_MSIL2A_20170605T151911_N0206_R068_T22WEV.SAFE")
            .join("GRANULE")
            .join("IMG_DATA");
        std::fs::create_dir_all(&baseline).unwrap();
        std::fs::write(baseline.join("L2A_T22WEV_20170605T151911_B05_20m.jp2"), b"jp2").unwrap();

        let store = LocalBlobStore::new(root.path());
        let gate = AcquisitionGate::new("L2A", "_20m.jp2", scratch.path()).unwrap();
        match gate.acquire(&store, &scene()) {
            Err(IceSurfError::AmbiguousBand { band, candidates }) => {
                assert_eq!(band, "B05");
                assert_eq!(candidates.len(), 2);
                assert!(candidates[0].to_string_lossy().contains("N0205"));
                assert!(candidates[1].to_string_lossy().contains("N0206"));
            }
            other => panic!("unexpected result {:?}", other),
        }
        // nothing was fetched
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_product_date_tag() {
        let dir = tempfile::tempdir().unwrap();
        let gate = AcquisitionGate::new("L2A", "_20m.jp2", dir.path()).unwrap();
        assert_eq!(gate.product_date_tag(&scene()), "L2A_20170605");
    }
}
