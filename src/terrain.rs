use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use glam::DVec3;
use ndarray::parallel::prelude::*;
use ndarray::Array2;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::geometry::{fetch_vertex, triangle_centroid, triangle_normal_area, TRI_VERT};
use crate::refraction::refract_sun_dir;
use crate::scene::{GeomType, Ray, Ray8, TerrainScene};

/// Default lift of the ray origin above the triangle centroid [m]. Avoids
/// self-intersection after the origin is truncated to `f32` at the scene
/// boundary.
pub const DEFAULT_RAY_ORG_ELEV: f64 = 0.1;

/// Configured terrain with a committed occlusion scene. Pure Rust; the
/// Python-facing wrapper is [`TerrainRunner`].
///
/// Two co-registered DEMs are held: the outer grid acts as occluder
/// geometry and supplies the tilted triangles, the inner grid (the outer's
/// core subregion) supplies the horizontal reference triangles. Both stay
/// untouched across correction calls; the scene is built once here and
/// reused for every sun position.
pub struct Terrain {
    scene: TerrainScene,
    vert_grid: Arc<Vec<f32>>,
    dem_dim_1: usize,
    vert_grid_in: Vec<f32>,
    dem_dim_in_1: usize,
    pixel_per_gc: usize,
    offset_gc: usize,
    mask: Array2<u8>,
    num_gc_y: usize,
    num_gc_x: usize,
    num_tri: usize,
    dist_search: f64,
    sw_dir_cor_max: f64,
    dot_prod_min: f64,
    ray_org_elev: f64,
}

/// Per-triangle quantities surviving both self-shadow culls: the lifted ray
/// origin, the (possibly refracted) unit sun vector and the clipped
/// correction contribution.
struct TriSample {
    ray_org: DVec3,
    sun_dir: DVec3,
    contrib: f32,
}

impl Terrain {
    /// Validate the configuration, cache it and build the occlusion scene.
    ///
    /// # Arguments
    /// * `vert_grid` - outer DEM vertex buffer, flat (x, y, z) [m, ENU]
    /// * `dem_dim_0`, `dem_dim_1` - outer DEM vertex rows / columns
    /// * `vert_grid_in` - inner DEM vertex buffer, flat (x, y, z) [m, ENU]
    /// * `dem_dim_in_0`, `dem_dim_in_1` - inner DEM vertex rows / columns
    /// * `pixel_per_gc` - DEM pixels per aggregation cell edge
    /// * `offset_gc` - outer frame width in aggregation cells
    /// * `mask` - (num_gc_y, num_gc_x) byte mask; 1 = process cell
    /// * `dist_search` - shadow search distance [km]
    /// * `geom_type` - occlusion scene geometry mode
    /// * `sw_dir_cor_max` - upper clip on the per-triangle contribution
    /// * `ang_max` - maximum zenith angle of the sun considered above the
    ///   local horizon [degree]
    /// * `ray_org_elev` - ray origin lift along the tilted normal [m]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vert_grid: Vec<f32>,
        dem_dim_0: usize,
        dem_dim_1: usize,
        vert_grid_in: Vec<f32>,
        dem_dim_in_0: usize,
        dem_dim_in_1: usize,
        pixel_per_gc: usize,
        offset_gc: usize,
        mask: Array2<u8>,
        dist_search: f64,
        geom_type: GeomType,
        sw_dir_cor_max: f64,
        ang_max: f64,
        ray_org_elev: f64,
    ) -> Result<Self> {
        if pixel_per_gc < 1 {
            bail!("pixel_per_gc must be at least 1");
        }
        if !(0.0 < ang_max && ang_max <= 90.0) {
            bail!("ang_max must lie in (0, 90] degree, got {ang_max}");
        }
        if sw_dir_cor_max <= 0.0 {
            bail!("sw_dir_cor_max must be positive, got {sw_dir_cor_max}");
        }
        if dist_search <= 0.0 {
            bail!("dist_search must be positive, got {dist_search} km");
        }
        if ray_org_elev <= 0.0 {
            bail!("ray_org_elev must be positive, got {ray_org_elev} m");
        }

        let frame = 2 * offset_gc * pixel_per_gc;
        if dem_dim_in_0 + frame != dem_dim_0 || dem_dim_in_1 + frame != dem_dim_1 {
            bail!(
                "inner DEM dimensions ({dem_dim_in_0}, {dem_dim_in_1}) must equal the outer \
                 dimensions ({dem_dim_0}, {dem_dim_1}) minus 2 * offset_gc * pixel_per_gc"
            );
        }
        if dem_dim_in_0 < 2 || dem_dim_in_1 < 2 {
            bail!("inner DEM must be at least 2 x 2 vertices, got ({dem_dim_in_0}, {dem_dim_in_1})");
        }
        if (dem_dim_in_0 - 1) % pixel_per_gc != 0 || (dem_dim_in_1 - 1) % pixel_per_gc != 0 {
            bail!(
                "inner DEM pixels ({}, {}) are not divisible into {pixel_per_gc}-pixel grid cells",
                dem_dim_in_0 - 1,
                dem_dim_in_1 - 1
            );
        }
        if vert_grid_in.len() != dem_dim_in_0 * dem_dim_in_1 * 3 {
            bail!(
                "inner vertex buffer length {} does not match DEM dimensions \
                 ({dem_dim_in_0}, {dem_dim_in_1})",
                vert_grid_in.len()
            );
        }

        let num_gc_y = (dem_dim_in_0 - 1) / pixel_per_gc;
        let num_gc_x = (dem_dim_in_1 - 1) / pixel_per_gc;
        if mask.dim() != (num_gc_y, num_gc_x) {
            bail!(
                "mask shape {:?} does not match the aggregation grid ({num_gc_y}, {num_gc_x})",
                mask.dim()
            );
        }

        let num_tri = (dem_dim_in_0 - 1) * (dem_dim_in_1 - 1) * 2;
        println!("Number of triangles: {num_tri}");

        let dist_search_m = dist_search * 1000.0; // [km] to [m]
        println!("Search distance: {dist_search_m} m");
        println!("ang_max: {ang_max} degree");
        println!("sw_dir_cor_max: {sw_dir_cor_max}");

        let start = Instant::now();
        let vert_grid = Arc::new(vert_grid);
        let scene = TerrainScene::build(Arc::clone(&vert_grid), dem_dim_0, dem_dim_1, geom_type)?;
        println!("Total initialisation time: {} s", start.elapsed().as_secs_f64());

        Ok(Self {
            scene,
            vert_grid,
            dem_dim_1,
            vert_grid_in,
            dem_dim_in_1,
            pixel_per_gc,
            offset_gc,
            mask,
            num_gc_y,
            num_gc_x,
            num_tri,
            dist_search: dist_search_m,
            sw_dir_cor_max,
            dot_prod_min: ang_max.to_radians().cos(),
            ray_org_elev,
        })
    }

    pub fn num_gc(&self) -> (usize, usize) {
        (self.num_gc_y, self.num_gc_x)
    }

    /// Shared per-triangle setup of all three engines: tilted and
    /// horizontal triangle geometry, sun vector (optionally bent by
    /// refraction) and both self-shadow culls. Returns `None` when the sun
    /// is below the local horizon or behind the tilted surface.
    fn sample_triangle(
        &self,
        k: usize,
        m: usize,
        n: usize,
        sun_pos: DVec3,
        refrac_cor: bool,
    ) -> Option<TriSample> {
        // tilted triangle from the outer DEM
        let shift = self.pixel_per_gc * self.offset_gc;
        let ind = TRI_VERT[n](self.dem_dim_1, k + shift, m + shift);
        let v0 = fetch_vertex(&self.vert_grid, ind[0]);
        let v1 = fetch_vertex(&self.vert_grid, ind[1]);
        let v2 = fetch_vertex(&self.vert_grid, ind[2]);
        let cent = triangle_centroid(v0, v1, v2);
        let (norm_tilt, area_tilt) = triangle_normal_area(v0, v1, v2);

        // lift applied in f64, before the origin narrows to f32
        let ray_org = cent + norm_tilt * self.ray_org_elev;

        // horizontal reference triangle from the inner DEM
        let ind = TRI_VERT[n](self.dem_dim_in_1, k, m);
        let w0 = fetch_vertex(&self.vert_grid_in, ind[0]);
        let w1 = fetch_vertex(&self.vert_grid_in, ind[1]);
        let w2 = fetch_vertex(&self.vert_grid_in, ind[2]);
        let (norm_hori, area_hori) = triangle_normal_area(w0, w1, w2);
        let surf_enl_fac = area_tilt / area_hori;

        let mut sun_dir = (sun_pos - ray_org).normalize();
        let mut dot_prod_hs = norm_hori.dot(sun_dir);

        if refrac_cor {
            // elevation above the reference surface, from the centroid gap
            let cent_base = triangle_centroid(w0, w1, w2);
            let elevation = (cent - cent_base).length();
            (sun_dir, dot_prod_hs) = refract_sun_dir(sun_dir, norm_hori, dot_prod_hs, elevation);
        }

        // self-shadowing (Earth)
        if dot_prod_hs <= self.dot_prod_min {
            return None;
        }
        // self-shadowing (triangle)
        let dot_prod_ts = norm_tilt.dot(sun_dir);
        if dot_prod_ts <= 0.0 {
            return None;
        }

        let contrib = ((dot_prod_ts / dot_prod_hs) * surf_enl_fac).min(self.sw_dir_cor_max) as f32;
        Some(TriSample {
            ray_org,
            sun_dir,
            contrib,
        })
    }

    fn make_ray(&self, sample: &TriSample, id: u32) -> Ray {
        Ray::new(
            [
                sample.ray_org.x as f32,
                sample.ray_org.y as f32,
                sample.ray_org.z as f32,
            ],
            [
                sample.sun_dir.x as f32,
                sample.sun_dir.y as f32,
                sample.sun_dir.z as f32,
            ],
            0.0,
            self.dist_search as f32,
            id,
        )
    }

    fn log_ray_stats(&self, start: Instant, num_rays: usize) {
        println!("Ray tracing time: {} s", start.elapsed().as_secs_f64());
        println!("Number of rays shot: {num_rays}");
        println!(
            "Fraction of rays required: {}",
            num_rays as f64 / self.num_tri as f64
        );
    }

    /// Correction factors with one occlusion query per triangle (the only
    /// engine supporting atmospheric refraction). Returns the aggregation
    /// grid and the number of rays shot.
    pub fn sw_dir_cor(&self, sun_pos: [f64; 3], refrac_cor: bool) -> (Array2<f32>, usize) {
        let start = Instant::now();
        let sun_pos = DVec3::from_array(sun_pos);
        let num_tri_per_gc = (self.pixel_per_gc * self.pixel_per_gc * 2) as f32;

        let mut sw_dir_cor = Array2::<f32>::zeros((self.num_gc_y, self.num_gc_x));
        let num_rays: usize = sw_dir_cor
            .outer_iter_mut()
            .into_par_iter()
            .enumerate()
            .map(|(i, mut row)| {
                let mut rays_row = 0usize;
                for j in 0..self.num_gc_x {
                    if self.mask[[i, j]] != 1 {
                        row[j] = f32::NAN;
                        continue;
                    }
                    let mut acc = 0.0f32;
                    for k in (i * self.pixel_per_gc)..((i + 1) * self.pixel_per_gc) {
                        for m in (j * self.pixel_per_gc)..((j + 1) * self.pixel_per_gc) {
                            for n in 0..2 {
                                let Some(sample) =
                                    self.sample_triangle(k, m, n, sun_pos, refrac_cor)
                                else {
                                    continue;
                                };
                                let mut ray = self.make_ray(&sample, 0);
                                self.scene.occluded1(&mut ray);
                                if ray.tfar > 0.0 {
                                    // miss leaves tfar untouched; hit sets -inf
                                    acc += sample.contrib;
                                }
                                rays_row += 1;
                            }
                        }
                    }
                    row[j] = acc / num_tri_per_gc;
                }
                rays_row
            })
            .sum();

        self.log_ray_stats(start, num_rays);
        (sw_dir_cor, num_rays)
    }

    /// Correction factors with all surviving rays of a grid cell submitted
    /// as one coherent batch. Refraction is not supported by this engine.
    pub fn sw_dir_cor_coherent(&self, sun_pos: [f64; 3]) -> (Array2<f32>, usize) {
        let start = Instant::now();
        let sun_pos = DVec3::from_array(sun_pos);
        let num_tri_per_gc = self.pixel_per_gc * self.pixel_per_gc * 2;

        let mut sw_dir_cor = Array2::<f32>::zeros((self.num_gc_y, self.num_gc_x));
        let num_rays: usize = sw_dir_cor
            .outer_iter_mut()
            .into_par_iter()
            .enumerate()
            .map(|(i, mut row)| {
                let mut rays_row = 0usize;
                let mut rays: Vec<Ray> = Vec::with_capacity(num_tri_per_gc);
                let mut contrib: Vec<f32> = Vec::with_capacity(num_tri_per_gc);
                for j in 0..self.num_gc_x {
                    if self.mask[[i, j]] != 1 {
                        row[j] = f32::NAN;
                        continue;
                    }
                    rays.clear();
                    contrib.clear();
                    for k in (i * self.pixel_per_gc)..((i + 1) * self.pixel_per_gc) {
                        for m in (j * self.pixel_per_gc)..((j + 1) * self.pixel_per_gc) {
                            for n in 0..2 {
                                let Some(sample) = self.sample_triangle(k, m, n, sun_pos, false)
                                else {
                                    continue;
                                };
                                rays.push(self.make_ray(&sample, rays.len() as u32));
                                contrib.push(sample.contrib);
                            }
                        }
                    }
                    self.scene.occluded1m(&mut rays);
                    rays_row += rays.len();

                    let agg: f32 = rays
                        .iter()
                        .filter(|ray| ray.tfar > 0.0)
                        .map(|ray| contrib[ray.id as usize])
                        .sum();
                    row[j] = agg / num_tri_per_gc as f32;
                }
                rays_row
            })
            .sum();

        self.log_ray_stats(start, num_rays);
        (sw_dir_cor, num_rays)
    }

    /// Correction factors with rays submitted in packets of eight gathered
    /// from 2 x 2 pixel blocks. Requires an even `pixel_per_gc`; refraction
    /// is not supported by this engine.
    pub fn sw_dir_cor_coherent_rp8(&self, sun_pos: [f64; 3]) -> Result<(Array2<f32>, usize)> {
        if self.pixel_per_gc % 2 != 0 {
            bail!("method is only implemented for even 'pixel_per_gc' values");
        }

        let start = Instant::now();
        let sun_pos = DVec3::from_array(sun_pos);
        let num_tri_per_gc = (self.pixel_per_gc * self.pixel_per_gc * 2) as f32;

        let mut sw_dir_cor = Array2::<f32>::zeros((self.num_gc_y, self.num_gc_x));
        let num_rays: usize = sw_dir_cor
            .outer_iter_mut()
            .into_par_iter()
            .enumerate()
            .map(|(i, mut row)| {
                let mut rays_row = 0usize;
                for j in 0..self.num_gc_x {
                    if self.mask[[i, j]] != 1 {
                        row[j] = f32::NAN;
                        continue;
                    }
                    let mut agg = 0.0f32;
                    for k in ((i * self.pixel_per_gc)..((i + 1) * self.pixel_per_gc)).step_by(2) {
                        for m in ((j * self.pixel_per_gc)..((j + 1) * self.pixel_per_gc)).step_by(2)
                        {
                            let mut ray8 = Ray8::default();
                            let mut valid = [0i32; 8]; // 0: inactive lane
                            let mut contrib = [0.0f32; 8];
                            let mut lanes = 0usize;
                            for k_block in k..(k + 2) {
                                for m_block in m..(m + 2) {
                                    for n in 0..2 {
                                        let Some(sample) = self
                                            .sample_triangle(k_block, m_block, n, sun_pos, false)
                                        else {
                                            continue;
                                        };
                                        ray8.set_lane(
                                            lanes,
                                            [
                                                sample.ray_org.x as f32,
                                                sample.ray_org.y as f32,
                                                sample.ray_org.z as f32,
                                            ],
                                            [
                                                sample.sun_dir.x as f32,
                                                sample.sun_dir.y as f32,
                                                sample.sun_dir.z as f32,
                                            ],
                                            0.0,
                                            self.dist_search as f32,
                                        );
                                        valid[lanes] = -1; // -1: active lane
                                        contrib[lanes] = sample.contrib;
                                        lanes += 1;
                                    }
                                }
                            }
                            self.scene.occluded8(&valid, &mut ray8);
                            rays_row += lanes;
                            for lane in 0..lanes {
                                if ray8.tfar[lane] > 0.0 {
                                    agg += contrib[lane];
                                }
                            }
                        }
                    }
                    row[j] = agg / num_tri_per_gc;
                }
                rays_row
            })
            .sum();

        self.log_ray_stats(start, num_rays);
        Ok((sw_dir_cor, num_rays))
    }
}

fn as_sun_pos(sun_pos: &PyReadonlyArray1<f64>) -> PyResult<[f64; 3]> {
    let v = sun_pos.as_array();
    if v.len() != 3 {
        return Err(PyValueError::new_err(
            "sun_pos must have exactly three components",
        ));
    }
    Ok([v[0], v[1], v[2]])
}

/// Python-facing terrain handle. Configuration and scene are built once by
/// `initialise`; the three correction methods can then be called for any
/// number of sun positions. All compute runs without the GIL.
#[pyclass]
pub struct TerrainRunner {
    terrain: Option<Terrain>,
}

impl Default for TerrainRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[pymethods]
impl TerrainRunner {
    #[new]
    pub fn new() -> Self {
        Self { terrain: None }
    }

    /// Configure the terrain and build the occlusion scene.
    ///
    /// # Arguments
    /// * `vert_grid` - flat (x, y, z) vertex buffer of the outer DEM [m]
    /// * `dem_dim_0`, `dem_dim_1` - outer DEM vertex rows / columns
    /// * `vert_grid_in` - flat vertex buffer of the inner DEM [m]
    /// * `dem_dim_in_0`, `dem_dim_in_1` - inner DEM vertex rows / columns
    /// * `pixel_per_gc` - DEM pixels per grid cell edge
    /// * `offset_gc` - outer frame width in grid cells
    /// * `mask` - (num_gc_y, num_gc_x) uint8 mask; 1 = compute, else NaN
    /// * `dist_search` - shadow search distance [km]
    /// * `geom_type` - "triangle", "quad" or "grid" (default "grid")
    /// * `sw_dir_cor_max` - upper clip on per-triangle contributions
    /// * `ang_max` - horizon threshold angle [degree]
    /// * `ray_org_elev` - ray origin lift [m]
    #[allow(clippy::too_many_arguments)]
    #[pyo3(signature = (vert_grid, dem_dim_0, dem_dim_1, vert_grid_in,
        dem_dim_in_0, dem_dim_in_1, pixel_per_gc, offset_gc, mask,
        dist_search=50.0, geom_type="grid", sw_dir_cor_max=25.0,
        ang_max=89.9, ray_org_elev=DEFAULT_RAY_ORG_ELEV))]
    pub fn initialise(
        &mut self,
        py: Python,
        vert_grid: PyReadonlyArray1<f32>,
        dem_dim_0: usize,
        dem_dim_1: usize,
        vert_grid_in: PyReadonlyArray1<f32>,
        dem_dim_in_0: usize,
        dem_dim_in_1: usize,
        pixel_per_gc: usize,
        offset_gc: usize,
        mask: PyReadonlyArray2<u8>,
        dist_search: f64,
        geom_type: &str,
        sw_dir_cor_max: f64,
        ang_max: f64,
        ray_org_elev: f64,
    ) -> PyResult<()> {
        let vert_grid = vert_grid.as_array().to_vec();
        let vert_grid_in = vert_grid_in.as_array().to_vec();
        let mask = mask.as_array().to_owned();
        let geom_type = GeomType::from_name(geom_type);

        let terrain = py
            .allow_threads(|| {
                Terrain::new(
                    vert_grid,
                    dem_dim_0,
                    dem_dim_1,
                    vert_grid_in,
                    dem_dim_in_0,
                    dem_dim_in_1,
                    pixel_per_gc,
                    offset_gc,
                    mask,
                    dist_search,
                    geom_type,
                    sw_dir_cor_max,
                    ang_max,
                    ray_org_elev,
                )
            })
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        self.terrain = Some(terrain);
        Ok(())
    }

    /// Release the occlusion scene and cached configuration.
    pub fn release(&mut self) {
        self.terrain = None;
    }

    /// Single-ray correction engine; the only one supporting atmospheric
    /// refraction. `sun_pos` is (x, y, z) in the DEM's ENU frame [m].
    /// Returns the (num_gc_y, num_gc_x) correction-factor grid.
    #[pyo3(signature = (sun_pos, refrac_cor=false))]
    pub fn sw_dir_cor(
        &self,
        py: Python,
        sun_pos: PyReadonlyArray1<f64>,
        refrac_cor: bool,
    ) -> PyResult<Py<PyArray2<f32>>> {
        let terrain = self.require_terrain()?;
        let sun_pos = as_sun_pos(&sun_pos)?;
        let (out, _num_rays) = py.allow_threads(|| terrain.sw_dir_cor(sun_pos, refrac_cor));
        Ok(out.into_pyarray(py).into())
    }

    /// Coherent-batch correction engine (no refraction support).
    pub fn sw_dir_cor_coherent(
        &self,
        py: Python,
        sun_pos: PyReadonlyArray1<f64>,
    ) -> PyResult<Py<PyArray2<f32>>> {
        let terrain = self.require_terrain()?;
        let sun_pos = as_sun_pos(&sun_pos)?;
        let (out, _num_rays) = py.allow_threads(|| terrain.sw_dir_cor_coherent(sun_pos));
        Ok(out.into_pyarray(py).into())
    }

    /// Packet-of-eight correction engine (no refraction support). Raises
    /// for odd `pixel_per_gc`.
    pub fn sw_dir_cor_coherent_rp8(
        &self,
        py: Python,
        sun_pos: PyReadonlyArray1<f64>,
    ) -> PyResult<Py<PyArray2<f32>>> {
        let terrain = self.require_terrain()?;
        let sun_pos = as_sun_pos(&sun_pos)?;
        let (out, _num_rays) = py
            .allow_threads(|| terrain.sw_dir_cor_coherent_rp8(sun_pos))
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(out.into_pyarray(py).into())
    }
}

impl TerrainRunner {
    fn require_terrain(&self) -> PyResult<&Terrain> {
        self.terrain
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("terrain is not initialised"))
    }
}
