//! I/O modules for blob storage, scene rasters and NetCDF outputs

pub mod blob_store;
pub mod acquisition;
pub mod band_table;
pub mod raster;
pub mod artifact;
pub mod summary_store;

pub use blob_store::{AzureBlobStore, BlobStore, LocalBlobStore};
pub use acquisition::{AcquisitionGate, AcquisitionOutcome};
pub use band_table::BandFileTable;
pub use raster::{ProjectionInfo, SceneRaster};
pub use artifact::{ArtifactStore, ClassificationArtifact};
pub use summary_store::SummaryStore;
