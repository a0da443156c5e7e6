/*!
 * Scene-by-scene driver
 *
 * Every (tile, date) pair runs acquisition, masking and the quality gate, then
 * classification, albedo, composition and aggregation. Each pair ends in
 * exactly one [`SceneOutcome`]; a failure in one scene never stops the run.
 */

use crate::config::PipelineConfig;
use crate::core::aggregator::Aggregator;
use crate::core::albedo::albedo_from_features;
use crate::core::classifier::ClassifierAdapter;
use crate::core::compositor::{final_mask, Compositor};
use crate::core::features::FeatureAssembler;
use crate::core::masks::MaskBuilder;
use crate::core::quality::{QualityGate, QualityReport};
use crate::io::acquisition::AcquisitionGate;
use crate::io::band_table::BandFileTable;
use crate::io::blob_store::{open_store, BlobStore};
use crate::io::raster::SceneRaster;
use crate::types::{IceSurfError, IceSurfResult, SceneId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const RUN_REPORT_FILE: &str = "run_report.json";

/// Step of scene processing in which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Acquisition,
    BandLookup,
    Masks,
    Quality,
    Features,
    Classification,
    Albedo,
    Composition,
    Aggregation,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Acquisition => "acquisition",
            PipelineStage::BandLookup => "band lookup",
            PipelineStage::Masks => "masks",
            PipelineStage::Quality => "quality",
            PipelineStage::Features => "features",
            PipelineStage::Classification => "classification",
            PipelineStage::Albedo => "albedo",
            PipelineStage::Composition => "composition",
            PipelineStage::Aggregation => "aggregation",
        };
        write!(f, "{}", name)
    }
}

/// How one scene ended
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SceneOutcome {
    Processed {
        scene: SceneId,
        quality: QualityReport,
        artifact: PathBuf,
        summary: PathBuf,
        algal_coverage_pct: f64,
    },
    DownloadIncomplete {
        scene: SceneId,
        reason: String,
        /// Blob names that matched the scene filter
        blobs: Vec<String>,
    },
    QualityRejected {
        scene: SceneId,
        report: QualityReport,
    },
    ProcessingError {
        scene: SceneId,
        stage: PipelineStage,
        cause: String,
    },
}

impl SceneOutcome {
    pub fn scene(&self) -> &SceneId {
        match self {
            SceneOutcome::Processed { scene, .. }
            | SceneOutcome::DownloadIncomplete { scene, .. }
            | SceneOutcome::QualityRejected { scene, .. }
            | SceneOutcome::ProcessingError { scene, .. } => scene,
        }
    }
}

/// Result of rebuilding one tile's time series
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TimeSeriesOutcome {
    Written {
        tile: String,
        dates: usize,
        path: PathBuf,
    },
    NoSummaries {
        tile: String,
    },
    Failed {
        tile: String,
        cause: String,
    },
}

/// Everything a run did, written as JSON next to the outputs
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub version: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub scenes: Vec<SceneOutcome>,
    pub time_series: Vec<TimeSeriesOutcome>,
    pub processed: Vec<String>,
    pub download_skipped: Vec<String>,
    pub quality_skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl RunReport {
    pub fn new(
        started: DateTime<Utc>,
        scenes: Vec<SceneOutcome>,
        time_series: Vec<TimeSeriesOutcome>,
    ) -> Self {
        let names = |keep: fn(&SceneOutcome) -> bool| -> Vec<String> {
            scenes
                .iter()
                .filter(|o| keep(o))
                .map(|o| o.scene().to_string())
                .collect()
        };

        let processed = names(|o| matches!(o, SceneOutcome::Processed { .. }));
        let download_skipped = names(|o| matches!(o, SceneOutcome::DownloadIncomplete { .. }));
        let quality_skipped = names(|o| matches!(o, SceneOutcome::QualityRejected { .. }));
        let failed = names(|o| matches!(o, SceneOutcome::ProcessingError { .. }));

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started,
            finished: Utc::now(),
            scenes,
            time_series,
            processed,
            download_skipped,
            quality_skipped,
            failed,
        }
    }

    pub fn to_json(&self) -> IceSurfResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> IceSurfResult<()> {
        std::fs::write(path, self.to_json()?)?;
        log::info!("Run report saved to {}", path.display());
        Ok(())
    }
}

struct StageFailure {
    stage: PipelineStage,
    error: IceSurfError,
}

fn at(stage: PipelineStage) -> impl FnOnce(IceSurfError) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// Classification pipeline over the configured tiles and dates
pub struct Pipeline {
    config: PipelineConfig,
    store: Box<dyn BlobStore>,
    acquisition: AcquisitionGate,
    masks: MaskBuilder,
    quality: QualityGate,
    assembler: FeatureAssembler,
    classifier: ClassifierAdapter,
}

impl Pipeline {
    /// Validate the configuration, open the blob store and load the classifier
    pub fn from_config(config: PipelineConfig) -> IceSurfResult<Self> {
        config.validate()?;
        let store = open_store(&config.storage)?;
        let classifier = ClassifierAdapter::from_file(&config.classifier_path)?;
        Self::new(config, store, classifier)
    }

    pub fn new(
        config: PipelineConfig,
        store: Box<dyn BlobStore>,
        classifier: ClassifierAdapter,
    ) -> IceSurfResult<Self> {
        Ok(Self {
            acquisition: AcquisitionGate::from_config(&config)?,
            masks: MaskBuilder::from_config(&config),
            quality: QualityGate::from_config(&config),
            assembler: FeatureAssembler::from_config(&config),
            config,
            store,
            classifier,
        })
    }

    /// Process every configured scene and rebuild each tile's time series.
    ///
    /// Fails only when an output directory or the run report cannot be written.
    pub fn run(&mut self) -> IceSurfResult<RunReport> {
        let started = Utc::now();
        let tiles = self.config.tiles.clone();
        let dates = self.config.dates.clone();
        log::info!("Starting run over {} tiles and {} dates", tiles.len(), dates.len());

        let mut scenes = Vec::with_capacity(tiles.len() * dates.len());
        let mut time_series = Vec::with_capacity(tiles.len());

        for tile in &tiles {
            let output_dir = self.config.tile_output_dir(tile);
            std::fs::create_dir_all(&output_dir)?;
            log::info!("Processing tile {}", tile);

            for date in &dates {
                let scene = SceneId::new(tile.as_str(), *date);
                scenes.push(self.process_scene(&scene, &output_dir));
            }

            time_series.push(Self::rebuild_time_series(tile, &output_dir));
        }

        let report = RunReport::new(started, scenes, time_series);
        report.write_json(&self.config.output_path.join(RUN_REPORT_FILE))?;

        log::info!("Run complete:");
        log::info!("  - Processed: {}", report.processed.len());
        log::info!("  - Incomplete downloads: {}", report.download_skipped.len());
        log::info!("  - Rejected by quality: {}", report.quality_skipped.len());
        log::info!("  - Failed: {}", report.failed.len());

        Ok(report)
    }

    /// Run one scene to completion, turning any failure into an outcome.
    /// The scene files are removed from the scratch directory afterwards.
    pub fn process_scene(&mut self, scene: &SceneId, output_dir: &Path) -> SceneOutcome {
        let outcome = match self.run_scene(scene, output_dir) {
            Ok(outcome) => outcome,
            Err(StageFailure { stage, error }) => {
                log::error!("Scene {} failed during {}: {}", scene, stage, error);
                SceneOutcome::ProcessingError {
                    scene: scene.clone(),
                    stage,
                    cause: error.to_string(),
                }
            }
        };

        if let Err(e) = self.acquisition.clear_scratch() {
            log::warn!("Could not clear scratch directory after {}: {}", scene, e);
        }

        outcome
    }

    fn run_scene(&mut self, scene: &SceneId, output_dir: &Path) -> Result<SceneOutcome, StageFailure> {
        let acquired = self
            .acquisition
            .acquire(self.store.as_ref(), scene)
            .map_err(at(PipelineStage::Acquisition))?;
        if let Some(reason) = acquired.incomplete_reason() {
            log::warn!("Skipping {}: {}", scene, reason);
            return Ok(SceneOutcome::DownloadIncomplete {
                scene: scene.clone(),
                reason,
                blobs: acquired.blobs,
            });
        }

        let bands = BandFileTable::from_directory(
            self.acquisition.scratch_dir(),
            self.acquisition.patterns(),
        )
        .map_err(at(PipelineStage::BandLookup))?;

        let masks = self.masks.build(&bands).map_err(at(PipelineStage::Masks))?;

        let (reference, _) = SceneRaster::read_band::<f32, _>(bands.reference())
            .map_err(at(PipelineStage::Quality))?;
        let quality = self
            .quality
            .assess(&masks.ice, &masks.cloud, &reference)
            .map_err(at(PipelineStage::Quality))?;
        if !quality.passed {
            log::warn!(
                "Skipping {}: useable area {:.1}% below {:.1}%",
                scene,
                quality.useable_area_pct,
                self.config.minimum_useable_area
            );
            return Ok(SceneOutcome::QualityRejected {
                scene: scene.clone(),
                report: quality,
            });
        }

        let features = self
            .assembler
            .assemble(&bands, masks)
            .map_err(at(PipelineStage::Features))?;
        let mask = final_mask(&features.ice_mask, &features.cloud_mask, &features.band_sum())
            .map_err(at(PipelineStage::Composition))?;

        let classified = self
            .classifier
            .classify(&features, Some(&mask))
            .map_err(at(PipelineStage::Classification))?;
        let albedo = albedo_from_features(&features).map_err(at(PipelineStage::Albedo))?;

        let artifact = Compositor::new(output_dir)
            .compose(scene, &features, mask, classified, albedo)
            .map_err(at(PipelineStage::Composition))?;

        let (record, summary) = Aggregator::summarize_artifact(scene, &artifact, output_dir)
            .map_err(at(PipelineStage::Aggregation))?;

        log::info!("Scene {} processed", scene);
        Ok(SceneOutcome::Processed {
            scene: scene.clone(),
            quality,
            artifact,
            summary,
            algal_coverage_pct: record.algal_coverage(),
        })
    }

    fn rebuild_time_series(tile: &str, output_dir: &Path) -> TimeSeriesOutcome {
        match Aggregator::concat_all_dates(tile, output_dir) {
            Ok(Some((series, path))) => TimeSeriesOutcome::Written {
                tile: tile.to_string(),
                dates: series.len(),
                path,
            },
            Ok(None) => TimeSeriesOutcome::NoSummaries {
                tile: tile.to_string(),
            },
            Err(e) => {
                log::error!("Time series for tile {} failed: {}", tile, e);
                TimeSeriesOutcome::Failed {
                    tile: tile.to_string(),
                    cause: e.to_string(),
                }
            }
        }
    }
}
