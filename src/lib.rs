//! icesurf: Sentinel-2 ice surface classification and albedo
//!
//! Fetches L2A scenes tile by tile, masks them to clear-sky ice, classifies
//! every pixel into one of six surface classes with a random forest, estimates
//! broadband albedo, and writes per-scene NetCDF artifacts plus per-class
//! albedo summaries and a per-tile time series.

#[cfg(feature = "python")]
use pyo3::prelude::*;

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BandImage, BoolMask, ClassGrid, GridSpec, IceSurfError, IceSurfResult, SceneId,
    Sentinel2Band, SurfaceClass,
};
pub use config::{PipelineConfig, StorageConfig};
pub use crate::core::{Pipeline, RunReport, SceneOutcome};

/// Python module definition
#[cfg(feature = "python")]
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
    m.add_function(wrap_pyfunction!(narrowband_albedo, m)?)?;
    m.add_function(wrap_pyfunction!(cloud_mask, m)?)?;
    Ok(())
}

#[cfg(feature = "python")]
fn runtime_error(e: IceSurfError) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
}

/// Run the pipeline described by a JSON configuration file and return the
/// run report as JSON
#[cfg(feature = "python")]
#[pyfunction]
fn run_pipeline(config_path: String) -> PyResult<String> {
    let config = PipelineConfig::from_file(&config_path).map_err(runtime_error)?;
    let mut pipeline = Pipeline::from_config(config).map_err(runtime_error)?;
    let report = pipeline.run().map_err(runtime_error)?;
    report.to_json().map_err(runtime_error)
}

/// Broadband albedo from five reflectance bands
#[cfg(feature = "python")]
#[pyfunction]
fn narrowband_albedo(
    py: Python,
    b02: numpy::PyReadonlyArray2<f32>,
    b04: numpy::PyReadonlyArray2<f32>,
    b8a: numpy::PyReadonlyArray2<f32>,
    b11: numpy::PyReadonlyArray2<f32>,
    b12: numpy::PyReadonlyArray2<f32>,
) -> PyResult<Py<numpy::PyArray2<f32>>> {
    use numpy::IntoPyArray;

    let albedo = crate::core::narrowband_to_broadband(
        b02.as_array(),
        b04.as_array(),
        b8a.as_array(),
        b11.as_array(),
        b12.as_array(),
    )
    .map_err(|e| PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("{}", e)))?;

    Ok(albedo.into_pyarray(py).to_owned())
}

/// Boolean cloud mask from a cloud probability layer
#[cfg(feature = "python")]
#[pyfunction]
fn cloud_mask(
    py: Python,
    probability: numpy::PyReadonlyArray2<f32>,
    threshold: f32,
) -> PyResult<Py<numpy::PyArray2<bool>>> {
    use numpy::IntoPyArray;

    let probability = probability.as_array().to_owned();
    let mask = crate::core::cloud_mask_from_probability(&probability, threshold);
    Ok(mask.into_pyarray(py).to_owned())
}
