use crate::io::raster::{axis_coordinates, ProjectionInfo};
use crate::types::{
    BandImage, BoolMask, ClassGrid, GridSpec, IceSurfError, IceSurfResult, SceneId, SurfaceClass,
    UNCLASSIFIED,
};
use ndarray::{Array2, ArrayD, Ix2};
use std::path::{Path, PathBuf};

/// Name of the CF grid-mapping variable every gridded variable refers to
const GRID_MAPPING: &str = "Projection";

/// Everything persisted for one classified scene
#[derive(Debug, Clone)]
pub struct ClassificationArtifact {
    pub scene: SceneId,
    pub grid: GridSpec,
    pub classified: ClassGrid,
    pub albedo: BandImage,
    pub ice_mask: BoolMask,
    pub cloud_mask: BoolMask,
    pub final_mask: BoolMask,
    pub projection: ProjectionInfo,
    pub longitude: Array2<f64>,
    pub latitude: Array2<f64>,
}

/// Write a file through a temporary sibling that is renamed into place once
/// complete, so a reader never sees a partial file.
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> IceSurfResult<()>
where
    F: FnOnce(&Path) -> IceSurfResult<()>,
{
    let file_name = path
        .file_name()
        .ok_or_else(|| IceSurfError::Processing(format!("Not a file path: {}", path.display())))?
        .to_string_lossy()
        .to_string();
    let partial = path.with_file_name(format!(".{}.partial", file_name));
    if partial.exists() {
        std::fs::remove_file(&partial)?;
    }

    match write(&partial) {
        Ok(()) => {
            std::fs::rename(&partial, path)?;
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_file(&partial) {
                log::debug!("Could not remove {}: {}", partial.display(), cleanup);
            }
            Err(e)
        }
    }
}

pub(crate) fn history_attribute() -> String {
    format!(
        "{} created by icesurf {}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        env!("CARGO_PKG_VERSION")
    )
}

pub(crate) fn into_grid<T>(values: ArrayD<T>, what: &str) -> IceSurfResult<Array2<T>> {
    values
        .into_dimensionality::<Ix2>()
        .map_err(|e| IceSurfError::InvalidFormat(format!("{} is not a 2-D grid: {}", what, e)))
}

/// NetCDF persistence of classification artifacts
pub struct ArtifactStore;

impl ArtifactStore {
    pub fn file_name(scene: &SceneId) -> String {
        format!(
            "{}_{}_Classification_and_Albedo_Data.nc",
            scene.tile,
            scene.compact_date()
        )
    }

    /// Write the artifact into `dir`, replacing any previous one for the scene
    pub fn write(artifact: &ClassificationArtifact, dir: &Path) -> IceSurfResult<PathBuf> {
        let (rows, cols) = artifact.grid.shape();
        let layers = [
            ("classified", artifact.classified.dim()),
            ("albedo", artifact.albedo.dim()),
            ("Icemask", artifact.ice_mask.dim()),
            ("Cloudmask", artifact.cloud_mask.dim()),
            ("FinalMask", artifact.final_mask.dim()),
            ("longitude", artifact.longitude.dim()),
            ("latitude", artifact.latitude.dim()),
        ];
        for (name, dim) in layers {
            IceSurfError::check_shape(name, (rows, cols), dim)?;
        }

        let path = dir.join(Self::file_name(&artifact.scene));
        write_atomically(&path, |tmp| Self::write_netcdf(artifact, tmp))?;

        log::info!("Saved classification artifact {}", path.display());
        Ok(path)
    }

    fn write_netcdf(artifact: &ClassificationArtifact, path: &Path) -> IceSurfResult<()> {
        let grid = &artifact.grid;
        let (x, y) = axis_coordinates(grid);

        let mut file = netcdf::create(path)?;
        file.add_dimension("y", grid.height)?;
        file.add_dimension("x", grid.width)?;

        file.add_attribute("Conventions", "CF-1.4")?;
        file.add_attribute(
            "title",
            "Classified surface and albedo of the Greenland Ice Sheet from Sentinel-2",
        )?;
        file.add_attribute("tile", artifact.scene.tile.as_str())?;
        file.add_attribute("date", artifact.scene.compact_date())?;
        file.add_attribute("nx", grid.width as u32)?;
        file.add_attribute("ny", grid.height as u32)?;
        file.add_attribute("xmin", x.iter().copied().fold(f64::INFINITY, f64::min))?;
        file.add_attribute("ymax", y.iter().copied().fold(f64::NEG_INFINITY, f64::max))?;
        file.add_attribute("spacing", grid.geo_transform.pixel_width.abs())?;
        file.add_attribute("history", history_attribute())?;

        for (name, values, standard_name, axis) in [
            ("x", &x, "projection_x_coordinate", "X"),
            ("y", &y, "projection_y_coordinate", "Y"),
        ] {
            let mut var = file.add_variable::<f64>(name, &[name])?;
            var.add_attribute("units", "meters")?;
            var.add_attribute("standard_name", standard_name)?;
            var.add_attribute("point_spacing", "even")?;
            var.add_attribute("axis", axis)?;
            var.put_values(values.as_slice(), None, None)?;
        }

        {
            let projection = &artifact.projection;
            let mut var = file.add_variable::<i8>(GRID_MAPPING, &[])?;
            var.add_attribute("projected_crs_name", projection.projected_crs_name.as_str())?;
            var.add_attribute("grid_mapping_name", projection.grid_mapping_name.as_str())?;
            var.add_attribute(
                "scale_factor_at_central_meridian",
                projection.scale_factor_at_central_meridian,
            )?;
            var.add_attribute(
                "longitude_of_central_meridian",
                projection.longitude_of_central_meridian,
            )?;
            var.add_attribute(
                "latitude_of_projection_origin",
                projection.latitude_of_projection_origin,
            )?;
            var.add_attribute("false_easting", projection.false_easting)?;
            var.add_attribute("false_northing", projection.false_northing)?;
            if let Some(code) = projection.epsg_code {
                var.add_attribute("epsg_code", format!("EPSG:{}", code))?;
            }
            var.add_attribute("proj4", projection.proj4.as_str())?;
            var.add_attribute("spatial_ref", projection.spatial_ref.as_str())?;
            var.put_value(0i8, None)?;
        }

        {
            let classified: Vec<u8> = artifact.classified.iter().copied().collect();
            let mut var = file.add_variable::<u8>("classified", &["y", "x"])?;
            var.set_fill_value(UNCLASSIFIED)?;
            var.add_attribute("long_name", "Surface classified using Random Forest")?;
            var.add_attribute("units", "None")?;
            var.add_attribute("key", SurfaceClass::legend())?;
            var.add_attribute("grid_mapping", GRID_MAPPING)?;
            var.put_values(&classified, None, None)?;
        }

        {
            let albedo: Vec<f32> = artifact.albedo.iter().copied().collect();
            let mut var = file.add_variable::<f32>("albedo", &["y", "x"])?;
            var.set_fill_value(f32::NAN)?;
            var.add_attribute("long_name", "Surface albedo computed after Liang et al. (2002)")?;
            var.add_attribute("units", "dimensionless")?;
            var.add_attribute("grid_mapping", GRID_MAPPING)?;
            var.put_values(&albedo, None, None)?;
        }

        for (name, mask, long_name) in [
            ("Icemask", &artifact.ice_mask, "Land/ice mask on the scene grid"),
            ("Cloudmask", &artifact.cloud_mask, "Cloud probability above threshold"),
            ("FinalMask", &artifact.final_mask, "Pixels classified and given an albedo"),
        ] {
            let values: Vec<u8> = mask.iter().map(|&m| u8::from(m)).collect();
            let mut var = file.add_variable::<u8>(name, &["y", "x"])?;
            var.add_attribute("long_name", long_name)?;
            var.add_attribute("flag_values", "0, 1")?;
            var.add_attribute("grid_mapping", GRID_MAPPING)?;
            var.put_values(&values, None, None)?;
        }

        for (name, values, standard_name) in [
            ("longitude", &artifact.longitude, "longitude"),
            ("latitude", &artifact.latitude, "latitude"),
        ] {
            let data: Vec<f64> = values.iter().copied().collect();
            let mut var = file.add_variable::<f64>(name, &["y", "x"])?;
            var.add_attribute("units", "degrees")?;
            var.add_attribute("standard_name", standard_name)?;
            var.add_attribute("grid_mapping", GRID_MAPPING)?;
            var.put_values(&data, None, None)?;
        }

        Ok(())
    }

    /// Classified labels and albedo of a persisted artifact
    pub fn read_classified_albedo(path: &Path) -> IceSurfResult<(ClassGrid, BandImage)> {
        let file = netcdf::open(path)?;

        let classified = file.variable("classified").ok_or_else(|| {
            IceSurfError::InvalidFormat(format!("No 'classified' variable in {}", path.display()))
        })?;
        let classified = into_grid(classified.values::<u8>(None, None)?, "classified")?;

        let albedo = file.variable("albedo").ok_or_else(|| {
            IceSurfError::InvalidFormat(format!("No 'albedo' variable in {}", path.display()))
        })?;
        let albedo = into_grid(albedo.values::<f32>(None, None)?, "albedo")?;

        IceSurfError::check_shape("albedo", classified.dim(), albedo.dim())?;
        Ok((classified, albedo))
    }

    /// One of the 0/1 mask layers of a persisted artifact
    pub fn read_mask(path: &Path, name: &str) -> IceSurfResult<BoolMask> {
        let file = netcdf::open(path)?;
        let var = file.variable(name).ok_or_else(|| {
            IceSurfError::InvalidFormat(format!("No '{}' variable in {}", name, path.display()))
        })?;
        Ok(into_grid(var.values::<u8>(None, None)?, name)?.mapv(|v| v != 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use chrono::NaiveDate;
    use ndarray::array;

    fn artifact() -> ClassificationArtifact {
        let grid = GridSpec {
            width: 2,
            height: 2,
            geo_transform: GeoTransform::from_gdal([500000.0, 20.0, 0.0, 7600000.0, 0.0, -20.0]),
            projection: String::new(),
        };
        let final_mask = array![[true, false], [true, true]];
        ClassificationArtifact {
            scene: SceneId::new("22wev", NaiveDate::from_ymd_opt(2017, 6, 5).unwrap()),
            grid,
            classified: array![[1u8, 0], [4, 6]],
            albedo: array![[0.8f32, f32::NAN], [0.5, 0.2]],
            ice_mask: array![[true, true], [true, true]],
            cloud_mask: array![[false, true], [false, false]],
            final_mask,
            projection: ProjectionInfo::from_parts(
                r#"PROJCS["WGS 84 / UTM zone 22N",AUTHORITY["EPSG","32622"]]"#,
                "+proj=utm +zone=22 +datum=WGS84 +units=m +no_defs",
            ),
            longitude: Array2::from_elem((2, 2), -51.0),
            latitude: Array2::from_elem((2, 2), 68.5),
        }
    }

    #[test]
    fn test_file_name() {
        assert_eq!(
            ArtifactStore::file_name(&artifact().scene),
            "22wev_20170605_Classification_and_Albedo_Data.nc"
        );
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact();

        let path = ArtifactStore::write(&artifact, dir.path()).unwrap();
        assert!(path.exists());
        // only the final file remains
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let (classified, albedo) = ArtifactStore::read_classified_albedo(&path).unwrap();
        assert_eq!(classified, artifact.classified);
        assert!(albedo[[0, 1]].is_nan());
        assert_eq!(albedo[[1, 0]], 0.5);

        let final_mask = ArtifactStore::read_mask(&path, "FinalMask").unwrap();
        assert_eq!(final_mask, artifact.final_mask);
    }

    #[test]
    fn test_shape_mismatch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut artifact = artifact();
        artifact.albedo = Array2::zeros((3, 2));

        assert!(matches!(
            ArtifactStore::write(&artifact, dir.path()),
            Err(IceSurfError::ShapeMismatch { .. })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_write_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.nc");

        let result = write_atomically(&target, |tmp| {
            std::fs::write(tmp, b"partial")?;
            Err(IceSurfError::Processing("interrupted".to_string()))
        });

        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
