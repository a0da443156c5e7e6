//! Scene processing stages: masks, quality, features, classification,
//! albedo, composition, aggregation and the driver tying them together

pub mod masks;
pub mod quality;
pub mod features;
pub mod classifier;
pub mod albedo;
pub mod compositor;
pub mod aggregator;
pub mod pipeline;

// Re-export main types
pub use masks::{MaskBuilder, SceneMasks, cloud_mask_from_probability};
pub use quality::{QualityGate, QualityReport};
pub use features::{FeatureAssembler, FeatureGrid};
pub use classifier::{ClassifierAdapter, PixelClassifier, RandomForestModel};
pub use albedo::{albedo_from_features, narrowband_to_broadband};
pub use compositor::{Compositor, apply_final_mask, final_mask};
pub use aggregator::{Aggregator, Statistic, SummaryRecord, TileTimeSeries};
pub use pipeline::{Pipeline, PipelineStage, RunReport, SceneOutcome, TimeSeriesOutcome};
