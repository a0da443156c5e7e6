use crate::io::acquisition::{FileNamePatterns, CLOUD_LAYER_ID};
use crate::types::{IceSurfError, IceSurfResult, Sentinel2Band};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Local file of every feature band and of the cloud-probability layer
#[derive(Debug, Clone)]
pub struct BandFileTable {
    bands: BTreeMap<Sentinel2Band, PathBuf>,
    cloud_layer: PathBuf,
}

impl BandFileTable {
    /// Resolve every band against the files of a directory
    pub fn from_directory(dir: &Path, patterns: &FileNamePatterns) -> IceSurfResult<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        Self::from_files(&files, patterns)
    }

    /// Resolve every band against a list of files. Each band, and the cloud
    /// layer, must match exactly one file.
    pub fn from_files(files: &[PathBuf], patterns: &FileNamePatterns) -> IceSurfResult<Self> {
        let file_name = |p: &PathBuf| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        };

        let mut bands = BTreeMap::new();
        for band in Sentinel2Band::FEATURE_ORDER {
            let candidates: Vec<PathBuf> = files
                .iter()
                .filter(|p| patterns.band_id(&file_name(p)) == Some(band.id()))
                .cloned()
                .collect();
            bands.insert(band, Self::single(band.id(), candidates)?);
        }

        let clouds: Vec<PathBuf> = files
            .iter()
            .filter(|p| patterns.is_cloud_layer(&file_name(p)))
            .cloned()
            .collect();
        let cloud_layer = Self::single(CLOUD_LAYER_ID, clouds)?;

        Ok(Self { bands, cloud_layer })
    }

    fn single(id: &str, mut candidates: Vec<PathBuf>) -> IceSurfResult<PathBuf> {
        match candidates.len() {
            0 => Err(IceSurfError::MissingBand(id.to_string())),
            1 => Ok(candidates.remove(0)),
            _ => Err(IceSurfError::AmbiguousBand {
                band: id.to_string(),
                candidates,
            }),
        }
    }

    pub fn path(&self, band: Sentinel2Band) -> &Path {
        // every band of FEATURE_ORDER is inserted at construction
        self.bands[&band].as_path()
    }

    /// File defining the scene grid
    pub fn reference(&self) -> &Path {
        self.path(Sentinel2Band::REFERENCE)
    }

    pub fn cloud_layer(&self) -> &Path {
        &self.cloud_layer
    }

    /// Band files in feature order
    pub fn feature_paths(&self) -> impl Iterator<Item = (Sentinel2Band, &Path)> {
        Sentinel2Band::FEATURE_ORDER
            .iter()
            .map(move |b| (*b, self.path(*b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_files() -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Sentinel2Band::FEATURE_ORDER
            .iter()
            .map(|b| PathBuf::from(format!("/scratch/L2A_T22WEV_20170605_{}_20m.jp2", b)))
            .collect();
        files.push(PathBuf::from("/scratch/L2A_T22WEV_20170605_CLD_20m.jp2"));
        files.push(PathBuf::from("/scratch/L2A_T22WEV_20170605_SCL_20m.jp2"));
        files
    }

    #[test]
    fn test_resolves_every_band() {
        let patterns = FileNamePatterns::new("_20m.jp2").unwrap();
        let table = BandFileTable::from_files(&scene_files(), &patterns).unwrap();

        assert!(table.reference().ends_with("L2A_T22WEV_20170605_B02_20m.jp2"));
        assert!(table.path(Sentinel2Band::B8A).to_string_lossy().contains("_B8A_"));
        assert!(table.cloud_layer().to_string_lossy().contains("CLD"));

        let order: Vec<Sentinel2Band> = table.feature_paths().map(|(b, _)| b).collect();
        assert_eq!(order, Sentinel2Band::FEATURE_ORDER.to_vec());
    }

    #[test]
    fn test_missing_band() {
        let patterns = FileNamePatterns::new("_20m.jp2").unwrap();
        let files: Vec<PathBuf> = scene_files()
            .into_iter()
            .filter(|p| !p.to_string_lossy().contains("_B11_"))
            .collect();

        match BandFileTable::from_files(&files, &patterns) {
            Err(IceSurfError::MissingBand(band)) => assert_eq!(band, "B11"),
            other => panic!("expected MissingBand, got {:?}", other),
        }
    }

    #[test]
    fn test_ambiguous_band() {
        let patterns = FileNamePatterns::new("_20m.jp2").unwrap();
        let mut files = scene_files();
        files.push(PathBuf::from("/scratch/L2A_T22WEV_20170605T2_B04_20m.jp2"));

        match BandFileTable::from_files(&files, &patterns) {
            Err(IceSurfError::AmbiguousBand { band, candidates }) => {
                assert_eq!(band, "B04");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected AmbiguousBand, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_cloud_layer() {
        let patterns = FileNamePatterns::new("_20m.jp2").unwrap();
        let files: Vec<PathBuf> = scene_files()
            .into_iter()
            .filter(|p| !p.to_string_lossy().contains("CLD"))
            .collect();

        assert!(matches!(
            BandFileTable::from_files(&files, &patterns),
            Err(IceSurfError::MissingBand(id)) if id == "CLD"
        ));
    }
}
