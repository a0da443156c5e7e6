use crate::config::compact_dates;
use crate::core::aggregator::{Statistic, SummaryRecord, TileTimeSeries};
use crate::io::artifact::{history_attribute, into_grid, write_atomically};
use crate::types::{IceSurfError, IceSurfResult, SceneId, SurfaceClass};
use chrono::NaiveDate;
use ndarray::{Array2, Array3, Ix3};
use std::path::{Path, PathBuf};

const UNIX_EPOCH_UNITS: &str = "days since 1970-01-01";

fn unix_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn string_attribute(file: &netcdf::File, name: &str, path: &Path) -> IceSurfResult<String> {
    let attribute = file.attribute(name).ok_or_else(|| {
        IceSurfError::InvalidFormat(format!("No '{}' attribute in {}", name, path.display()))
    })?;
    match attribute.value()? {
        netcdf::AttrValue::Str(value) => Ok(value),
        other => Err(IceSurfError::InvalidFormat(format!(
            "Attribute '{}' in {} is not a string: {:?}",
            name,
            path.display(),
            other
        ))),
    }
}

fn write_class_axis(file: &mut netcdf::MutableFile) -> IceSurfResult<()> {
    file.add_dimension("classID", SurfaceClass::ALL.len())?;
    file.add_dimension("metric", Statistic::ALL.len())?;

    let labels: Vec<u8> = SurfaceClass::ALL.iter().map(|c| c.label()).collect();
    let abbreviations: Vec<&str> = SurfaceClass::ALL.iter().map(|c| c.abbreviation()).collect();
    let metrics: Vec<&str> = Statistic::ALL.iter().map(|s| s.name()).collect();

    {
        let mut var = file.add_variable::<u8>("classID", &["classID"])?;
        var.add_attribute("long_name", "Surface class label")?;
        var.add_attribute("abbreviations", abbreviations.join(" "))?;
        var.add_attribute("key", SurfaceClass::legend())?;
        var.put_values(&labels, None, None)?;
    }

    file.add_attribute("metrics", metrics.join(" "))?;
    Ok(())
}

/// NetCDF persistence of per-date summaries and per-tile time series
pub struct SummaryStore;

impl SummaryStore {
    pub fn summary_file_name(scene: &SceneId) -> String {
        format!("summary_data_{}_{}.nc", scene.tile, scene.compact_date())
    }

    pub fn time_series_file_name(tile: &str) -> String {
        format!("summary_data_all_dates_{}.nc", tile)
    }

    pub fn write_summary(record: &SummaryRecord, dir: &Path) -> IceSurfResult<PathBuf> {
        let path = dir.join(Self::summary_file_name(&record.scene));

        write_atomically(&path, |tmp| {
            let mut file = netcdf::create(tmp)?;
            file.add_attribute("Conventions", "CF-1.4")?;
            file.add_attribute("tile", record.scene.tile.as_str())?;
            file.add_attribute("date", record.scene.compact_date())?;
            file.add_attribute("algal_coverage", record.algal_coverage())?;
            file.add_attribute("history", history_attribute())?;
            write_class_axis(&mut file)?;

            let values: Vec<f64> = record.table.iter().copied().collect();
            let mut var = file.add_variable::<f64>("albedo_summary", &["classID", "metric"])?;
            var.set_fill_value(f64::NAN)?;
            var.add_attribute("long_name", "Albedo statistics per surface class")?;
            var.put_values(&values, None, None)?;
            Ok(())
        })?;

        log::info!("Saved summary {}", path.display());
        Ok(path)
    }

    pub fn read_summary(path: &Path) -> IceSurfResult<SummaryRecord> {
        let file = netcdf::open(path)?;
        let tile = string_attribute(&file, "tile", path)?;
        let date = string_attribute(&file, "date", path)?;
        let date = compact_dates::parse(&date).ok_or_else(|| {
            IceSurfError::InvalidFormat(format!("Invalid date '{}' in {}", date, path.display()))
        })?;

        let var = file.variable("albedo_summary").ok_or_else(|| {
            IceSurfError::InvalidFormat(format!("No summary table in {}", path.display()))
        })?;
        let table: Array2<f64> = into_grid(var.values::<f64>(None, None)?, "albedo_summary")?;

        SummaryRecord::new(SceneId::new(tile, date), table)
    }

    /// Per-date summaries of `tile` in `dir`, sorted by name. The combined
    /// time-series file and files of other tiles are not matched.
    pub fn discover_summaries(dir: &Path, tile: &str) -> IceSurfResult<Vec<PathBuf>> {
        let prefix = format!("summary_data_{}_", tile);
        let mut files = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let date = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".nc"));

            let is_summary = matches!(
                date,
                Some(d) if d.len() == 8
                    && d.bytes().all(|b| b.is_ascii_digit())
                    && NaiveDate::parse_from_str(d, "%Y%m%d").is_ok()
            );
            if is_summary && entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        log::debug!("Found {} summaries for tile {}", files.len(), tile);
        Ok(files)
    }

    pub fn write_time_series(series: &TileTimeSeries, dir: &Path) -> IceSurfResult<PathBuf> {
        let path = dir.join(Self::time_series_file_name(&series.tile));
        let epoch = unix_epoch();
        let days: Vec<i32> = series
            .dates
            .iter()
            .map(|d| (*d - epoch).num_days() as i32)
            .collect();

        write_atomically(&path, |tmp| {
            let mut file = netcdf::create(tmp)?;
            file.add_attribute("Conventions", "CF-1.4")?;
            file.add_attribute("tile", series.tile.as_str())?;
            file.add_attribute("history", history_attribute())?;
            file.add_dimension("date", series.len())?;
            write_class_axis(&mut file)?;

            {
                let mut var = file.add_variable::<i32>("date", &["date"])?;
                var.add_attribute("units", UNIX_EPOCH_UNITS)?;
                var.add_attribute("calendar", "standard")?;
                var.add_attribute("standard_name", "time")?;
                var.put_values(&days, None, None)?;
            }

            let values: Vec<f64> = series.data.iter().copied().collect();
            let mut var =
                file.add_variable::<f64>("albedo_summary", &["date", "classID", "metric"])?;
            var.set_fill_value(f64::NAN)?;
            var.add_attribute("long_name", "Albedo statistics per surface class and date")?;
            var.put_values(&values, None, None)?;
            Ok(())
        })?;

        log::info!("Saved time series {}", path.display());
        Ok(path)
    }

    pub fn read_time_series(path: &Path) -> IceSurfResult<TileTimeSeries> {
        let file = netcdf::open(path)?;
        let tile = string_attribute(&file, "tile", path)?;

        let var = file.variable("date").ok_or_else(|| {
            IceSurfError::InvalidFormat(format!("No date axis in {}", path.display()))
        })?;
        let epoch = unix_epoch();
        let dates: Vec<NaiveDate> = var
            .values::<i32>(None, None)?
            .iter()
            .map(|&d| epoch + chrono::Duration::days(i64::from(d)))
            .collect();

        let var = file.variable("albedo_summary").ok_or_else(|| {
            IceSurfError::InvalidFormat(format!("No summary table in {}", path.display()))
        })?;
        let data: Array3<f64> = var
            .values::<f64>(None, None)?
            .into_dimensionality::<Ix3>()
            .map_err(|e| IceSurfError::InvalidFormat(format!("Summary table: {}", e)))?;

        Ok(TileTimeSeries { tile, dates, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(day: u32, fill: f64) -> SummaryRecord {
        SummaryRecord::new(
            SceneId::new("22wev", NaiveDate::from_ymd_opt(2017, 7, day).unwrap()),
            Array2::from_elem((6, 8), fill),
        )
        .unwrap()
    }

    #[test]
    fn test_file_names() {
        let scene = record(5, 0.0).scene;
        assert_eq!(SummaryStore::summary_file_name(&scene), "summary_data_22wev_20170705.nc");
        assert_eq!(
            SummaryStore::time_series_file_name("22wev"),
            "summary_data_all_dates_22wev.nc"
        );
    }

    #[test]
    fn test_summary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut original = record(5, 0.5);
        original.table[[1, 1]] = f64::NAN;

        let path = SummaryStore::write_summary(&original, dir.path()).unwrap();
        let read = SummaryStore::read_summary(&path).unwrap();

        assert_eq!(read.scene, original.scene);
        assert!(read.table[[1, 1]].is_nan());
        assert_eq!(read.table[[5, 7]], 0.5);
    }

    #[test]
    fn test_discovery_skips_combined_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "summary_data_22wev_20170705.nc",
            "summary_data_22wev_20170710.nc",
            "summary_data_all_dates_22wev.nc",
            "summary_data_22wet_20170705.nc",
            "summary_data_22wev_2017070.nc",
            ".summary_data_22wev_20170715.nc.partial",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let found = SummaryStore::discover_summaries(dir.path(), "22wev").unwrap();
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["summary_data_22wev_20170705.nc", "summary_data_22wev_20170710.nc"]
        );
    }

    #[test]
    fn test_time_series_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let series =
            TileTimeSeries::from_records("22wev", vec![record(10, 2.0), record(5, 1.0)]).unwrap();

        let path = SummaryStore::write_time_series(&series, dir.path()).unwrap();
        let read = SummaryStore::read_time_series(&path).unwrap();

        assert_eq!(read, series);
        assert_eq!(read.dates[0], NaiveDate::from_ymd_opt(2017, 7, 5).unwrap());
    }
}
