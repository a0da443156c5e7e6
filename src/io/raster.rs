use crate::types::{BoolMask, GeoTransform, GridSpec, IceSurfError, IceSurfResult};
use gdal::raster::{Buffer, GdalType};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Geographic WGS84 with longitude first, whatever the GDAL axis-order defaults
const WGS84_LONLAT: &str = "+proj=longlat +datum=WGS84 +no_defs";

/// GDAL raster access for scene bands and masks
pub struct SceneRaster;

impl SceneRaster {
    /// Grid of the first band of a raster file
    pub fn grid_spec<P: AsRef<Path>>(path: P) -> IceSurfResult<GridSpec> {
        let dataset = Dataset::open(path.as_ref())?;
        Self::grid_of(&dataset)
    }

    fn grid_of(dataset: &Dataset) -> IceSurfResult<GridSpec> {
        let (width, height) = dataset.raster_size();
        let geo_transform = dataset.geo_transform()?;

        Ok(GridSpec {
            width,
            height,
            geo_transform: GeoTransform::from_gdal(geo_transform),
            projection: dataset.projection(),
        })
    }

    /// Read band 1 of a raster together with its grid
    pub fn read_band<T, P>(path: P) -> IceSurfResult<(Array2<T>, GridSpec)>
    where
        T: GdalType + Copy,
        P: AsRef<Path>,
    {
        let dataset = Dataset::open(path.as_ref())?;
        let grid = Self::grid_of(&dataset)?;
        log::debug!(
            "Reading {} ({} x {})",
            path.as_ref().display(),
            grid.width,
            grid.height
        );

        let rasterband = dataset.rasterband(1)?;
        let buffer = rasterband.read_as::<T>(
            (0, 0),
            (grid.width, grid.height),
            (grid.width, grid.height),
            None,
        )?;

        let array = Array2::from_shape_vec(grid.shape(), buffer.data).map_err(|e| {
            IceSurfError::InvalidFormat(format!("Failed to reshape raster data: {}", e))
        })?;

        Ok((array, grid))
    }

    /// Reproject a mask raster onto a target grid with nearest-neighbour
    /// resampling. Any non-zero value marks a mask pixel.
    pub fn reproject_mask<P: AsRef<Path>>(mask_path: P, grid: &GridSpec) -> IceSurfResult<BoolMask> {
        log::info!(
            "Reprojecting {} onto {} x {} grid",
            mask_path.as_ref().display(),
            grid.width,
            grid.height
        );

        let source = Dataset::open(mask_path.as_ref())?;
        let driver = DriverManager::get_driver_by_name("MEM")?;
        let mut target = driver.create_with_band_type::<u8, _>(
            "",
            grid.width as isize,
            grid.height as isize,
            1,
        )?;
        target.set_geo_transform(&grid.geo_transform.to_gdal())?;
        target.set_projection(&grid.projection)?;

        let status = unsafe {
            gdal_sys::GDALReprojectImage(
                source.c_dataset(),
                std::ptr::null(),
                target.c_dataset(),
                std::ptr::null(),
                gdal_sys::GDALResampleAlg::GRA_NearestNeighbour,
                0.0,
                0.0,
                None,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if status != gdal_sys::CPLErr::CE_None {
            return Err(IceSurfError::Processing(format!(
                "Reprojection of {} failed",
                mask_path.as_ref().display()
            )));
        }

        let rasterband = target.rasterband(1)?;
        let buffer = rasterband.read_as::<u8>(
            (0, 0),
            (grid.width, grid.height),
            (grid.width, grid.height),
            None,
        )?;
        let values = Array2::from_shape_vec(grid.shape(), buffer.data).map_err(|e| {
            IceSurfError::InvalidFormat(format!("Failed to reshape reprojected mask: {}", e))
        })?;

        Ok(values.mapv(|v| v != 0))
    }

    /// Write a single-band raster as GeoTIFF on the given grid
    pub fn write_geotiff<T, P>(data: &Array2<T>, grid: &GridSpec, path: P) -> IceSurfResult<()>
    where
        T: GdalType + Copy,
        P: AsRef<Path>,
    {
        IceSurfError::check_shape("GeoTIFF data", grid.shape(), data.dim())?;

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<T, _>(
            path.as_ref(),
            grid.width as isize,
            grid.height as isize,
            1,
        )?;
        dataset.set_geo_transform(&grid.geo_transform.to_gdal())?;
        if !grid.projection.is_empty() {
            dataset.set_projection(&grid.projection)?;
        }

        let mut rasterband = dataset.rasterband(1)?;
        let values: Vec<T> = data.iter().copied().collect();
        let buffer = Buffer::new((grid.width, grid.height), values);
        rasterband.write((0, 0), (grid.width, grid.height), &buffer)?;

        log::debug!("Wrote GeoTIFF {}", path.as_ref().display());
        Ok(())
    }

    /// Boolean mask as a 0/1 GeoTIFF
    pub fn write_mask<P: AsRef<Path>>(mask: &BoolMask, grid: &GridSpec, path: P) -> IceSurfResult<()> {
        Self::write_geotiff(&mask.mapv(u8::from), grid, path)
    }

    /// Longitude and latitude of every pixel centre
    pub fn lon_lat(grid: &GridSpec) -> IceSurfResult<(Array2<f64>, Array2<f64>)> {
        let source = SpatialRef::from_wkt(&grid.projection)?;
        let target = SpatialRef::from_proj4(WGS84_LONLAT)?;
        let transform = CoordTransform::new(&source, &target)?;

        let (rows, cols) = grid.shape();
        let mut xs = Vec::with_capacity(rows * cols);
        let mut ys = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                let (x, y) = grid.geo_transform.pixel_center(row, col);
                xs.push(x);
                ys.push(y);
            }
        }
        let mut zs = vec![0.0; xs.len()];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

        let shape_err =
            |e: ndarray::ShapeError| IceSurfError::Processing(format!("Coordinate grid: {}", e));
        let lon = Array2::from_shape_vec((rows, cols), xs).map_err(shape_err)?;
        let lat = Array2::from_shape_vec((rows, cols), ys).map_err(shape_err)?;

        Ok((lon, lat))
    }
}

/// Projected x (columns) and y (rows) of pixel centres on an unrotated grid
pub fn axis_coordinates(grid: &GridSpec) -> (Vec<f64>, Vec<f64>) {
    let gt = &grid.geo_transform;
    let x = (0..grid.width)
        .map(|col| gt.top_left_x + (col as f64 + 0.5) * gt.pixel_width)
        .collect();
    let y = (0..grid.height)
        .map(|row| gt.top_left_y + (row as f64 + 0.5) * gt.pixel_height)
        .collect();
    (x, y)
}

/// CF grid-mapping attributes of a projected CRS
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionInfo {
    pub projected_crs_name: String,
    pub grid_mapping_name: String,
    pub scale_factor_at_central_meridian: f64,
    pub longitude_of_central_meridian: f64,
    pub latitude_of_projection_origin: f64,
    pub false_easting: f64,
    pub false_northing: f64,
    pub epsg_code: Option<u32>,
    pub proj4: String,
    pub spatial_ref: String,
}

impl ProjectionInfo {
    pub fn from_wkt(wkt: &str) -> IceSurfResult<Self> {
        let srs = SpatialRef::from_wkt(wkt)?;
        let proj4 = srs.to_proj4()?;
        Ok(Self::from_parts(wkt, proj4.trim()))
    }

    /// Build from the WKT and the PROJ.4 rendering of the same CRS
    pub fn from_parts(wkt: &str, proj4: &str) -> Self {
        let params = proj4_params(proj4);
        let number = |key: &str, default: f64| {
            params
                .get(key)
                .and_then(|v| v.as_deref())
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(default)
        };
        let method = params
            .get("proj")
            .and_then(|v| v.clone())
            .unwrap_or_default();

        let (grid_mapping_name, scale, lon0, lat0, x0, y0) = match method.as_str() {
            "utm" => {
                let zone = number("zone", 0.0);
                let south = params.contains_key("south");
                (
                    "transverse_mercator".to_string(),
                    0.9996,
                    zone * 6.0 - 183.0,
                    0.0,
                    500_000.0,
                    if south { 10_000_000.0 } else { 0.0 },
                )
            }
            "tmerc" | "stere" => (
                if method == "tmerc" {
                    "transverse_mercator".to_string()
                } else {
                    "polar_stereographic".to_string()
                },
                number("k", number("k_0", 1.0)),
                number("lon_0", 0.0),
                number("lat_0", 0.0),
                number("x_0", 0.0),
                number("y_0", 0.0),
            ),
            other => (
                other.to_string(),
                number("k", 1.0),
                number("lon_0", 0.0),
                number("lat_0", 0.0),
                number("x_0", 0.0),
                number("y_0", 0.0),
            ),
        };

        Self {
            projected_crs_name: crs_name(wkt),
            grid_mapping_name,
            scale_factor_at_central_meridian: scale,
            longitude_of_central_meridian: lon0,
            latitude_of_projection_origin: lat0,
            false_easting: x0,
            false_northing: y0,
            epsg_code: epsg_code(wkt),
            proj4: proj4.to_string(),
            spatial_ref: wkt.to_string(),
        }
    }
}

fn proj4_params(proj4: &str) -> HashMap<String, Option<String>> {
    proj4
        .split_whitespace()
        .filter_map(|token| token.strip_prefix('+'))
        .map(|token| match token.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (token.to_string(), None),
        })
        .collect()
}

/// Name of the outermost CRS node of a WKT string
fn crs_name(wkt: &str) -> String {
    ["PROJCS[\"", "PROJCRS[\"", "GEOGCS[\"", "GEOGCRS[\""]
        .iter()
        .find_map(|tag| {
            let start = wkt.find(tag)? + tag.len();
            let len = wkt[start..].find('"')?;
            Some(wkt[start..start + len].to_string())
        })
        .unwrap_or_default()
}

/// EPSG code of the outermost CRS node (its authority comes last in WKT)
fn epsg_code(wkt: &str) -> Option<u32> {
    let start = wkt.rfind("\"EPSG\",")? + "\"EPSG\",".len();
    let digits: String = wkt[start..]
        .chars()
        .skip_while(|c| *c == '"' || c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
