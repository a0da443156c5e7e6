use crate::io::artifact::ArtifactStore;
use crate::io::summary_store::SummaryStore;
use crate::types::{BandImage, ClassGrid, IceSurfError, IceSurfResult, SceneId, SurfaceClass};
use chrono::NaiveDate;
use ndarray::{Array2, Array3, Axis};
use num_traits::Float;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Columns of a summary table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Statistic {
    Count,
    Mean,
    Std,
    Min,
    Q25,
    Median,
    Q75,
    Max,
}

impl Statistic {
    pub const ALL: [Statistic; 8] = [
        Statistic::Count,
        Statistic::Mean,
        Statistic::Std,
        Statistic::Min,
        Statistic::Q25,
        Statistic::Median,
        Statistic::Q75,
        Statistic::Max,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Statistic::Count => "count",
            Statistic::Mean => "mean",
            Statistic::Std => "std",
            Statistic::Min => "min",
            Statistic::Q25 => "25%",
            Statistic::Median => "50%",
            Statistic::Q75 => "75%",
            Statistic::Max => "max",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Linear interpolation between the closest ranks of sorted values
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Count, mean, sample standard deviation, min, quartiles and max of the
/// finite values. Everything but the count is NaN for an empty input, and
/// the standard deviation is NaN for fewer than two values.
pub fn describe<T: Float>(values: &[T]) -> [f64; 8] {
    let mut sorted: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .filter_map(|v| v.to_f64())
        .collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    if n == 0 {
        let mut empty = [f64::NAN; 8];
        empty[Statistic::Count.index()] = 0.0;
        return empty;
    }

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let std = if n < 2 {
        f64::NAN
    } else {
        let ss: f64 = sorted.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    };

    [
        n as f64,
        mean,
        std,
        sorted[0],
        quantile_sorted(&sorted, 0.25),
        quantile_sorted(&sorted, 0.5),
        quantile_sorted(&sorted, 0.75),
        sorted[n - 1],
    ]
}

/// Per-class albedo statistics of one scene
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRecord {
    pub scene: SceneId,
    /// class x statistic, rows in [`SurfaceClass::ALL`] order
    pub table: Array2<f64>,
}

impl SummaryRecord {
    pub fn new(scene: SceneId, table: Array2<f64>) -> IceSurfResult<Self> {
        IceSurfError::check_shape(
            "summary table",
            (SurfaceClass::ALL.len(), Statistic::ALL.len()),
            table.dim(),
        )?;
        Ok(Self { scene, table })
    }

    /// Group finite albedo values by class label and describe each group
    pub fn from_grids(scene: SceneId, classified: &ClassGrid, albedo: &BandImage) -> IceSurfResult<Self> {
        IceSurfError::check_shape("albedo", classified.dim(), albedo.dim())?;

        let mut groups: Vec<Vec<f32>> = vec![Vec::new(); SurfaceClass::ALL.len()];
        for (&label, &value) in classified.iter().zip(albedo.iter()) {
            if let Some(class) = SurfaceClass::from_label(label) {
                if value.is_finite() {
                    groups[class.index()].push(value);
                }
            }
        }

        #[cfg(feature = "parallel")]
        let stats: Vec<[f64; 8]> = groups.par_iter().map(|v| describe(v.as_slice())).collect();
        #[cfg(not(feature = "parallel"))]
        let stats: Vec<[f64; 8]> = groups.iter().map(|v| describe(v.as_slice())).collect();

        let mut table = Array2::from_elem((SurfaceClass::ALL.len(), Statistic::ALL.len()), f64::NAN);
        for (mut row, group_stats) in table.axis_iter_mut(Axis(0)).zip(stats) {
            for (cell, stat) in row.iter_mut().zip(group_stats) {
                *cell = stat;
            }
        }

        Self::new(scene, table)
    }

    pub fn value(&self, class: SurfaceClass, statistic: Statistic) -> f64 {
        self.table[[class.index(), statistic.index()]]
    }

    pub fn count(&self, class: SurfaceClass) -> usize {
        self.value(class, Statistic::Count) as usize
    }

    /// Share (%) of algae among the ice-surface classes; snow is excluded.
    /// NaN when none of those classes is present.
    pub fn algal_coverage(&self) -> f64 {
        let algae = self.count(SurfaceClass::LightAlgae) + self.count(SurfaceClass::HeavyAlgae);
        let surface = algae
            + self.count(SurfaceClass::Water)
            + self.count(SurfaceClass::Cryoconite)
            + self.count(SurfaceClass::CleanIce);

        if surface == 0 {
            f64::NAN
        } else {
            algae as f64 / surface as f64 * 100.0
        }
    }
}

/// Summary records of one tile stacked along a date axis
#[derive(Debug, Clone, PartialEq)]
pub struct TileTimeSeries {
    pub tile: String,
    pub dates: Vec<NaiveDate>,
    /// date x class x statistic
    pub data: Array3<f64>,
}

impl TileTimeSeries {
    /// Stack records in chronological order. Every record must belong to
    /// `tile` and dates must be distinct.
    pub fn from_records(tile: &str, mut records: Vec<SummaryRecord>) -> IceSurfResult<Self> {
        if records.is_empty() {
            return Err(IceSurfError::Processing(format!(
                "No summary records for tile {}",
                tile
            )));
        }
        if let Some(other) = records.iter().find(|r| r.scene.tile != tile) {
            return Err(IceSurfError::InvalidFormat(format!(
                "Summary of {} does not belong to tile {}",
                other.scene, tile
            )));
        }

        records.sort_by_key(|r| r.scene.date);
        if let Some(pair) = records.windows(2).find(|w| w[0].scene.date == w[1].scene.date) {
            return Err(IceSurfError::InvalidFormat(format!(
                "Duplicate summary for {}",
                pair[0].scene
            )));
        }

        let views: Vec<_> = records.iter().map(|r| r.table.view()).collect();
        let data = ndarray::stack(Axis(0), &views)
            .map_err(|e| IceSurfError::Processing(format!("Failed to stack summaries: {}", e)))?;

        Ok(Self {
            tile: tile.to_string(),
            dates: records.iter().map(|r| r.scene.date).collect(),
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Summary of the i-th date
    pub fn record(&self, i: usize) -> Option<SummaryRecord> {
        let date = *self.dates.get(i)?;
        Some(SummaryRecord {
            scene: SceneId::new(self.tile.clone(), date),
            table: self.data.index_axis(Axis(0), i).to_owned(),
        })
    }
}

/// Per-scene summaries and per-tile time series
pub struct Aggregator;

impl Aggregator {
    /// Summarise a persisted artifact and save the summary next to it
    pub fn summarize_artifact(
        scene: &SceneId,
        artifact_path: &Path,
        output_dir: &Path,
    ) -> IceSurfResult<(SummaryRecord, PathBuf)> {
        let (classified, albedo) = ArtifactStore::read_classified_albedo(artifact_path)?;
        let record = SummaryRecord::from_grids(scene.clone(), &classified, &albedo)?;

        for class in SurfaceClass::ALL {
            log::debug!(
                "{}: {} pixels, mean albedo {:.3}",
                class,
                record.count(class),
                record.value(class, Statistic::Mean)
            );
        }
        log::info!(
            "Algal coverage for {}: {:.2}%",
            scene,
            record.algal_coverage()
        );

        let path = SummaryStore::write_summary(&record, output_dir)?;
        Ok((record, path))
    }

    /// Rebuild the tile's time series from every per-date summary in
    /// `output_dir`. Returns `None` when there is no summary yet.
    pub fn concat_all_dates(
        tile: &str,
        output_dir: &Path,
    ) -> IceSurfResult<Option<(TileTimeSeries, PathBuf)>> {
        let files = SummaryStore::discover_summaries(output_dir, tile)?;
        if files.is_empty() {
            log::warn!("No summaries found for tile {}", tile);
            return Ok(None);
        }

        let records = files
            .iter()
            .map(|path| SummaryStore::read_summary(path))
            .collect::<IceSurfResult<Vec<_>>>()?;
        let series = TileTimeSeries::from_records(tile, records)?;
        let path = SummaryStore::write_time_series(&series, output_dir)?;

        log::info!(
            "Time series for tile {} holds {} dates: {}",
            tile,
            series.len(),
            path.display()
        );
        Ok(Some((series, path)))
    }
}
