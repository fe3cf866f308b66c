use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

/// Geometry mode for the occlusion scene. Selected by name; unknown names
/// fall back to `Grid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeomType {
    Triangle,
    Quad,
    Grid,
}

impl GeomType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "triangle" => GeomType::Triangle,
            "quad" => GeomType::Quad,
            _ => GeomType::Grid,
        }
    }

    fn label(self) -> &'static str {
        match self {
            GeomType::Triangle => "triangle",
            GeomType::Quad => "quad",
            GeomType::Grid => "grid",
        }
    }
}

/// Occlusion ray. `tfar` carries the hit/miss answer: a hit sets it to
/// negative infinity, a miss leaves it untouched.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Ray {
    pub org: [f32; 3],
    pub tnear: f32,
    pub dir: [f32; 3],
    pub tfar: f32,
    pub id: u32,
    pub _pad: [u32; 3],
}

impl Ray {
    pub fn new(org: [f32; 3], dir: [f32; 3], tnear: f32, tfar: f32, id: u32) -> Self {
        Self {
            org,
            tnear,
            dir,
            tfar,
            id,
            _pad: [0; 3],
        }
    }
}

/// Packet of eight rays in lane-major layout. Lane validity is passed
/// separately to `occluded8` (-1 = active, 0 = inactive).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ray8 {
    pub org_x: [f32; 8],
    pub org_y: [f32; 8],
    pub org_z: [f32; 8],
    pub dir_x: [f32; 8],
    pub dir_y: [f32; 8],
    pub dir_z: [f32; 8],
    pub tnear: [f32; 8],
    pub tfar: [f32; 8],
    pub id: [u32; 8],
}

impl Ray8 {
    pub fn set_lane(&mut self, lane: usize, org: [f32; 3], dir: [f32; 3], tnear: f32, tfar: f32) {
        self.org_x[lane] = org[0];
        self.org_y[lane] = org[1];
        self.org_z[lane] = org[2];
        self.dir_x[lane] = dir[0];
        self.dir_y[lane] = dir[1];
        self.dir_z[lane] = dir[2];
        self.tnear[lane] = tnear;
        self.tfar[lane] = tfar;
        self.id[lane] = lane as u32;
    }
}

const MAX_LEAF_SIZE: u32 = 4;
const MAX_DEPTH: u32 = 64;
const STACK_SIZE: usize = 128;
// barycentric slack so rays grazing shared pixel edges still register a hit
const ROBUST_EPS: f32 = 1e-6;

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: [f32; 3],
    max: [f32; 3],
}

impl Aabb {
    fn empty() -> Self {
        Self {
            min: [f32::INFINITY; 3],
            max: [f32::NEG_INFINITY; 3],
        }
    }

    fn expand_point(&mut self, p: [f32; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    fn expand_aabb(&mut self, other: &Aabb) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    fn center(&self, axis: usize) -> f32 {
        (self.min[axis] + self.max[axis]) * 0.5
    }

    fn extent(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Slab test against a ray with precomputed reciprocal direction.
    fn hit(&self, org: [f32; 3], inv_dir: [f32; 3], tnear: f32, tfar: f32) -> bool {
        let mut t0 = tnear;
        let mut t1 = tfar;
        for i in 0..3 {
            let mut lo = (self.min[i] - org[i]) * inv_dir[i];
            let mut hi = (self.max[i] - org[i]) * inv_dir[i];
            if inv_dir[i] < 0.0 {
                std::mem::swap(&mut lo, &mut hi);
            }
            t0 = t0.max(lo);
            t1 = t1.min(hi);
            if t0 > t1 {
                return false;
            }
        }
        true
    }
}

/// Flattened BVH node (forward-linked, leaves hold a primitive range).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BvhNode {
    aabb_min: [f32; 3],
    left: u32, // internal: left child; leaf: first primitive
    aabb_max: [f32; 3],
    right: u32, // internal: right child; leaf: primitive count
    flags: u32, // bit 0: leaf
    _pad: [u32; 3],
}

impl BvhNode {
    fn internal(aabb: Aabb, left: u32, right: u32) -> Self {
        Self {
            aabb_min: aabb.min,
            left,
            aabb_max: aabb.max,
            right,
            flags: 0,
            _pad: [0; 3],
        }
    }

    fn leaf(aabb: Aabb, first: u32, count: u32) -> Self {
        Self {
            aabb_min: aabb.min,
            left: first,
            aabb_max: aabb.max,
            right: count,
            flags: 1,
            _pad: [0; 3],
        }
    }

    fn is_leaf(&self) -> bool {
        (self.flags & 1) != 0
    }

    fn aabb(&self) -> Aabb {
        Aabb {
            min: self.aabb_min,
            max: self.aabb_max,
        }
    }
}

/// Scene primitives in one of the three geometry layouts. Quads and grid
/// cells split into two triangles along the (i, j+1)-(i+1, j) pixel
/// diagonal, the same diagonal the triangle layout uses, so the three modes
/// answer occlusion queries identically.
enum ScenePrims {
    Triangles(Vec<[u32; 3]>),
    Quads(Vec<[u32; 4]>),
    Grid {
        start_vertex_id: u32,
        stride: u32,
        width: u32,
        height: u32,
    },
}

impl ScenePrims {
    fn count(&self) -> usize {
        match self {
            ScenePrims::Triangles(t) => t.len(),
            ScenePrims::Quads(q) => q.len(),
            ScenePrims::Grid { width, height, .. } => {
                ((width - 1) as usize) * ((height - 1) as usize)
            }
        }
    }

    /// The one or two triangles making up primitive `prim_id`, as vertex ids.
    fn triangles(&self, prim_id: u32) -> ([u32; 3], Option<[u32; 3]>) {
        match self {
            ScenePrims::Triangles(tris) => (tris[prim_id as usize], None),
            ScenePrims::Quads(quads) => {
                let [v0, v1, v2, v3] = quads[prim_id as usize];
                ([v0, v1, v3], Some([v2, v3, v1]))
            }
            ScenePrims::Grid {
                start_vertex_id,
                stride,
                width,
                ..
            } => {
                let cells_per_row = width - 1;
                let row = prim_id / cells_per_row;
                let col = prim_id % cells_per_row;
                let v0 = start_vertex_id + row * stride + col;
                let v1 = v0 + 1;
                let v2 = v0 + stride + 1;
                let v3 = v0 + stride;
                ([v0, v1, v3], Some([v2, v3, v1]))
            }
        }
    }
}

/// BVH-backed occlusion scene over the outer DEM. The vertex buffer is
/// shared with the caller through the `Arc`; the scene never copies it.
pub struct TerrainScene {
    vert_grid: Arc<Vec<f32>>,
    prims: ScenePrims,
    nodes: Vec<BvhNode>,
    prim_indices: Vec<u32>,
}

impl TerrainScene {
    /// Build the scene over a `(dem_dim_0, dem_dim_1)` vertex grid and
    /// commit the BVH. Reports dimensions, primitive counts and build time
    /// on stdout.
    pub fn build(
        vert_grid: Arc<Vec<f32>>,
        dem_dim_0: usize,
        dem_dim_1: usize,
        geom_type: GeomType,
    ) -> Result<Self> {
        if dem_dim_0 < 2 || dem_dim_1 < 2 {
            bail!("DEM must be at least 2 x 2 vertices, got ({dem_dim_0}, {dem_dim_1})");
        }
        let num_vert = dem_dim_0 * dem_dim_1;
        if vert_grid.len() != num_vert * 3 {
            bail!(
                "vertex buffer length {} does not match DEM dimensions ({dem_dim_0}, {dem_dim_1})",
                vert_grid.len()
            );
        }
        println!("DEM dimensions: ({dem_dim_0}, {dem_dim_1})");
        println!("Number of vertices: {num_vert}");
        println!("Selected geometry type: {}", geom_type.label());

        let prims = match geom_type {
            GeomType::Triangle => {
                let num_tri = (dem_dim_0 - 1) * (dem_dim_1 - 1) * 2;
                println!("Number of triangles: {num_tri}");
                let mut tris = Vec::with_capacity(num_tri);
                for i in 0..(dem_dim_0 - 1) {
                    for j in 0..(dem_dim_1 - 1) {
                        let v = (i * dem_dim_1 + j) as u32;
                        let dim_1 = dem_dim_1 as u32;
                        tris.push([v, v + 1, v + dim_1]);
                        tris.push([v + 1, v + dim_1 + 1, v + dim_1]);
                    }
                }
                ScenePrims::Triangles(tris)
            }
            GeomType::Quad => {
                let num_quad = (dem_dim_0 - 1) * (dem_dim_1 - 1);
                println!("Number of quads: {num_quad}");
                let mut quads = Vec::with_capacity(num_quad);
                for i in 0..(dem_dim_0 - 1) {
                    for j in 0..(dem_dim_1 - 1) {
                        let v = (i * dem_dim_1 + j) as u32;
                        let dim_1 = dem_dim_1 as u32;
                        quads.push([v, v + 1, v + dim_1 + 1, v + dim_1]);
                    }
                }
                ScenePrims::Quads(quads)
            }
            GeomType::Grid => ScenePrims::Grid {
                start_vertex_id: 0,
                stride: dem_dim_1 as u32,
                width: dem_dim_1 as u32,
                height: dem_dim_0 as u32,
            },
        };

        let start = Instant::now();
        let mut scene = Self {
            vert_grid,
            prims,
            nodes: Vec::new(),
            prim_indices: Vec::new(),
        };
        scene.commit()?;
        println!("BVH build time: {} s", start.elapsed().as_secs_f64());
        Ok(scene)
    }

    fn vertex(&self, id: u32) -> [f32; 3] {
        let ind = id as usize * 3;
        [
            self.vert_grid[ind],
            self.vert_grid[ind + 1],
            self.vert_grid[ind + 2],
        ]
    }

    fn prim_aabb(&self, prim_id: u32) -> Aabb {
        let (tri_a, tri_b) = self.prims.triangles(prim_id);
        let mut aabb = Aabb::empty();
        for id in tri_a {
            aabb.expand_point(self.vertex(id));
        }
        if let Some(tri) = tri_b {
            for id in tri {
                aabb.expand_point(self.vertex(id));
            }
        }
        aabb
    }

    /// Median-split build over primitive bounds, flattening into `nodes`.
    fn commit(&mut self) -> Result<()> {
        let prim_count = self.prims.count();
        if prim_count == 0 {
            bail!("cannot build a scene without primitives");
        }
        let this = &*self;
        let prim_aabbs: Vec<Aabb> = (0..prim_count as u32)
            .into_par_iter()
            .map(|p| this.prim_aabb(p))
            .collect();

        let mut world_aabb = Aabb::empty();
        for aabb in &prim_aabbs {
            world_aabb.expand_aabb(aabb);
        }

        self.prim_indices = (0..prim_count as u32).collect();
        self.nodes = Vec::with_capacity(2 * prim_count);
        build_recursive(
            &prim_aabbs,
            &mut self.prim_indices,
            &mut self.nodes,
            world_aabb,
            0,
            prim_count as u32,
            0,
        );
        Ok(())
    }

    /// Möller-Trumbore any-hit test against one triangle, with barycentric
    /// slack for rays grazing shared edges.
    fn hit_triangle(&self, org: [f32; 3], dir: [f32; 3], tnear: f32, tfar: f32, tri: [u32; 3]) -> bool {
        let v0 = self.vertex(tri[0]);
        let v1 = self.vertex(tri[1]);
        let v2 = self.vertex(tri[2]);

        let e1 = [v1[0] - v0[0], v1[1] - v0[1], v1[2] - v0[2]];
        let e2 = [v2[0] - v0[0], v2[1] - v0[1], v2[2] - v0[2]];

        let h = [
            dir[1] * e2[2] - dir[2] * e2[1],
            dir[2] * e2[0] - dir[0] * e2[2],
            dir[0] * e2[1] - dir[1] * e2[0],
        ];
        let det = e1[0] * h[0] + e1[1] * h[1] + e1[2] * h[2];
        if det.abs() < 1e-12 {
            return false; // ray parallel to triangle plane
        }

        let inv_det = 1.0 / det;
        let s = [org[0] - v0[0], org[1] - v0[1], org[2] - v0[2]];
        let u = inv_det * (s[0] * h[0] + s[1] * h[1] + s[2] * h[2]);
        if !(-ROBUST_EPS..=1.0 + ROBUST_EPS).contains(&u) {
            return false;
        }

        let q = [
            s[1] * e1[2] - s[2] * e1[1],
            s[2] * e1[0] - s[0] * e1[2],
            s[0] * e1[1] - s[1] * e1[0],
        ];
        let v = inv_det * (dir[0] * q[0] + dir[1] * q[1] + dir[2] * q[2]);
        if v < -ROBUST_EPS || u + v > 1.0 + ROBUST_EPS {
            return false;
        }

        let t = inv_det * (e2[0] * q[0] + e2[1] * q[1] + e2[2] * q[2]);
        t > tnear && t < tfar
    }

    fn hit_prim(&self, org: [f32; 3], dir: [f32; 3], tnear: f32, tfar: f32, prim_id: u32) -> bool {
        let (tri_a, tri_b) = self.prims.triangles(prim_id);
        if self.hit_triangle(org, dir, tnear, tfar, tri_a) {
            return true;
        }
        match tri_b {
            Some(tri) => self.hit_triangle(org, dir, tnear, tfar, tri),
            None => false,
        }
    }

    /// Single-ray occlusion query. On any hit within `(tnear, tfar)` the
    /// ray's `tfar` is set to negative infinity; a miss leaves it untouched.
    pub fn occluded1(&self, ray: &mut Ray) {
        let inv_dir = [1.0 / ray.dir[0], 1.0 / ray.dir[1], 1.0 / ray.dir[2]];
        let mut stack = [0u32; STACK_SIZE];
        let mut stack_len = 1usize; // root at index 0

        while stack_len > 0 {
            stack_len -= 1;
            let node = &self.nodes[stack[stack_len] as usize];
            if !node.aabb().hit(ray.org, inv_dir, ray.tnear, ray.tfar) {
                continue;
            }
            if node.is_leaf() {
                for p in node.left..node.left + node.right {
                    let prim_id = self.prim_indices[p as usize];
                    if self.hit_prim(ray.org, ray.dir, ray.tnear, ray.tfar, prim_id) {
                        ray.tfar = f32::NEG_INFINITY;
                        return;
                    }
                }
            } else {
                stack[stack_len] = node.left;
                stack[stack_len + 1] = node.right;
                stack_len += 2;
            }
        }
    }

    /// Occlusion query for a coherent batch of rays; same per-ray `tfar`
    /// convention as `occluded1`.
    pub fn occluded1m(&self, rays: &mut [Ray]) {
        for ray in rays {
            self.occluded1(ray);
        }
    }

    /// Occlusion query for a packet of eight rays. Lanes with `valid` set
    /// to 0 are never touched; active lanes follow the `tfar` convention of
    /// `occluded1`. The packet descends a node if any live lane hits its
    /// bounds.
    pub fn occluded8(&self, valid: &[i32; 8], ray8: &mut Ray8) {
        let mut live = [false; 8];
        let mut any_live = false;
        let mut inv_dir = [[0.0f32; 3]; 8];
        for lane in 0..8 {
            if valid[lane] == -1 {
                live[lane] = true;
                any_live = true;
                inv_dir[lane] = [
                    1.0 / ray8.dir_x[lane],
                    1.0 / ray8.dir_y[lane],
                    1.0 / ray8.dir_z[lane],
                ];
            }
        }
        if !any_live {
            return;
        }

        let mut stack = [0u32; STACK_SIZE];
        let mut stack_len = 1usize;

        while stack_len > 0 {
            stack_len -= 1;
            let node = &self.nodes[stack[stack_len] as usize];
            let aabb = node.aabb();
            let mut enter = false;
            for lane in 0..8 {
                if live[lane]
                    && aabb.hit(
                        [ray8.org_x[lane], ray8.org_y[lane], ray8.org_z[lane]],
                        inv_dir[lane],
                        ray8.tnear[lane],
                        ray8.tfar[lane],
                    )
                {
                    enter = true;
                    break;
                }
            }
            if !enter {
                continue;
            }
            if node.is_leaf() {
                for p in node.left..node.left + node.right {
                    let prim_id = self.prim_indices[p as usize];
                    for lane in 0..8 {
                        if live[lane]
                            && self.hit_prim(
                                [ray8.org_x[lane], ray8.org_y[lane], ray8.org_z[lane]],
                                [ray8.dir_x[lane], ray8.dir_y[lane], ray8.dir_z[lane]],
                                ray8.tnear[lane],
                                ray8.tfar[lane],
                                prim_id,
                            )
                        {
                            ray8.tfar[lane] = f32::NEG_INFINITY;
                            live[lane] = false;
                        }
                    }
                }
                if live.iter().all(|l| !l) {
                    return;
                }
            } else {
                stack[stack_len] = node.left;
                stack[stack_len + 1] = node.right;
                stack_len += 2;
            }
        }
    }
}

fn build_recursive(
    prim_aabbs: &[Aabb],
    prim_indices: &mut [u32],
    nodes: &mut Vec<BvhNode>,
    aabb: Aabb,
    first: u32,
    count: u32,
    depth: u32,
) -> u32 {
    if count <= MAX_LEAF_SIZE || depth >= MAX_DEPTH {
        let node_idx = nodes.len() as u32;
        nodes.push(BvhNode::leaf(aabb, first, count));
        return node_idx;
    }

    // split at the median primitive centroid along the widest axis
    let extent = aabb.extent();
    let axis = if extent[0] > extent[1] && extent[0] > extent[2] {
        0
    } else if extent[1] > extent[2] {
        1
    } else {
        2
    };

    let range = &mut prim_indices[first as usize..(first + count) as usize];
    let mut centers: Vec<f32> = range
        .iter()
        .map(|&p| prim_aabbs[p as usize].center(axis))
        .collect();
    centers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let split_pos = centers[centers.len() / 2];
    let mut left = 0usize;
    let mut right = range.len();
    while left < right {
        if prim_aabbs[range[left] as usize].center(axis) < split_pos {
            left += 1;
        } else {
            right -= 1;
            range.swap(left, right);
        }
    }

    let left_count = left as u32;
    if left_count == 0 || left_count == count {
        // degenerate partition, emit a leaf
        let node_idx = nodes.len() as u32;
        nodes.push(BvhNode::leaf(aabb, first, count));
        return node_idx;
    }

    let bounds = |indices: &[u32]| {
        let mut aabb = Aabb::empty();
        for &p in indices {
            aabb.expand_aabb(&prim_aabbs[p as usize]);
        }
        aabb
    };
    let left_aabb = bounds(&prim_indices[first as usize..(first + left_count) as usize]);
    let right_aabb =
        bounds(&prim_indices[(first + left_count) as usize..(first + count) as usize]);

    // reserve the parent slot so children link forward
    let node_idx = nodes.len() as u32;
    nodes.push(BvhNode::leaf(Aabb::empty(), 0, 0));
    let left_idx = build_recursive(
        prim_aabbs,
        prim_indices,
        nodes,
        left_aabb,
        first,
        left_count,
        depth + 1,
    );
    let right_idx = build_recursive(
        prim_aabbs,
        prim_indices,
        nodes,
        right_aabb,
        first + left_count,
        count - left_count,
        depth + 1,
    );
    nodes[node_idx as usize] = BvhNode::internal(aabb, left_idx, right_idx);
    node_idx
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat vertex grid in the z = `z` plane with 1 m spacing.
    fn flat_grid(rows: usize, cols: usize, z: f32) -> Arc<Vec<f32>> {
        let mut vert = Vec::with_capacity(rows * cols * 3);
        for i in 0..rows {
            for j in 0..cols {
                vert.extend_from_slice(&[j as f32, i as f32, z]);
            }
        }
        Arc::new(vert)
    }

    /// Flat grid with one high ridge column at `ridge_col`.
    fn ridge_grid(rows: usize, cols: usize, ridge_col: usize, ridge_z: f32) -> Arc<Vec<f32>> {
        let mut vert = Vec::with_capacity(rows * cols * 3);
        for i in 0..rows {
            for j in 0..cols {
                let z = if j == ridge_col { ridge_z } else { 0.0 };
                vert.extend_from_slice(&[j as f32, i as f32, z]);
            }
        }
        Arc::new(vert)
    }

    #[test]
    fn test_downward_ray_hits_upward_misses() {
        let scene =
            TerrainScene::build(flat_grid(8, 8, 0.0), 8, 8, GeomType::Triangle).unwrap();
        let mut down = Ray::new([3.5, 3.5, 10.0], [0.0, 0.0, -1.0], 0.0, 1e6, 0);
        scene.occluded1(&mut down);
        assert_eq!(down.tfar, f32::NEG_INFINITY);

        let mut up = Ray::new([3.5, 3.5, 10.0], [0.0, 0.0, 1.0], 0.0, 1e6, 0);
        scene.occluded1(&mut up);
        assert_eq!(up.tfar, 1e6);
    }

    #[test]
    fn test_tfar_bounds_search_distance() {
        let scene =
            TerrainScene::build(flat_grid(8, 8, 0.0), 8, 8, GeomType::Triangle).unwrap();
        // terrain is 10 m below the origin but the search range ends at 5 m
        let mut ray = Ray::new([3.5, 3.5, 10.0], [0.0, 0.0, -1.0], 0.0, 5.0, 0);
        scene.occluded1(&mut ray);
        assert_eq!(ray.tfar, 5.0);
    }

    #[test]
    fn test_geometry_modes_agree() {
        let vert = ridge_grid(12, 12, 6, 30.0);
        let tri = TerrainScene::build(vert.clone(), 12, 12, GeomType::Triangle).unwrap();
        let quad = TerrainScene::build(vert.clone(), 12, 12, GeomType::Quad).unwrap();
        let grid = TerrainScene::build(vert, 12, 12, GeomType::Grid).unwrap();

        // fan of rays from west of the ridge towards the east, varying pitch
        // and origin height
        for n in 0..40 {
            let pitch = -0.5 + n as f32 * 0.05;
            let dir = [1.0, 0.1, pitch];
            for org_z in [1.0, 15.0, 40.0] {
                let org = [2.3, 5.1, org_z];
                let hits: Vec<bool> = [&tri, &quad, &grid]
                    .iter()
                    .map(|scene| {
                        let mut ray = Ray::new(org, dir, 0.0, 1e5, 0);
                        scene.occluded1(&mut ray);
                        ray.tfar == f32::NEG_INFINITY
                    })
                    .collect();
                assert_eq!(hits[0], hits[1], "quad disagrees at pitch {pitch}");
                assert_eq!(hits[0], hits[2], "grid disagrees at pitch {pitch}");
            }
        }
    }

    #[test]
    fn test_unknown_geom_name_defaults_to_grid() {
        assert_eq!(GeomType::from_name("bogus"), GeomType::Grid);
        assert_eq!(GeomType::from_name("triangle"), GeomType::Triangle);
        assert_eq!(GeomType::from_name("quad"), GeomType::Quad);
    }

    #[test]
    fn test_occluded8_respects_lane_mask() {
        let scene = TerrainScene::build(flat_grid(8, 8, 0.0), 8, 8, GeomType::Grid).unwrap();
        let mut ray8 = Ray8::default();
        let mut valid = [0i32; 8];
        // lane 0: active, pointing down (hit); lane 1: inactive, also down;
        // lane 2: active, pointing up (miss)
        ray8.set_lane(0, [3.5, 3.5, 10.0], [0.0, 0.0, -1.0], 0.0, 1e6);
        ray8.set_lane(1, [3.5, 3.5, 10.0], [0.0, 0.0, -1.0], 0.0, 1e6);
        ray8.set_lane(2, [3.5, 3.5, 10.0], [0.0, 0.0, 1.0], 0.0, 1e6);
        valid[0] = -1;
        valid[2] = -1;
        scene.occluded8(&valid, &mut ray8);
        assert_eq!(ray8.tfar[0], f32::NEG_INFINITY);
        assert_eq!(ray8.tfar[1], 1e6, "inactive lane was modified");
        assert_eq!(ray8.tfar[2], 1e6);
    }

    #[test]
    fn test_occluded8_matches_occluded1() {
        let scene = TerrainScene::build(ridge_grid(12, 12, 6, 30.0), 12, 12, GeomType::Triangle)
            .unwrap();
        let mut ray8 = Ray8::default();
        let mut valid = [0i32; 8];
        let mut singles = Vec::new();
        for lane in 0..8 {
            let org = [1.0 + lane as f32 * 0.5, 5.5, 1.0];
            // shallow lanes hit the ridge, the steep ones clear it
            let pitch = if lane >= 6 {
                30.0
            } else {
                0.1 + lane as f32 * 0.1
            };
            let dir = [1.0, 0.0, pitch];
            ray8.set_lane(lane, org, dir, 0.0, 1e5);
            valid[lane] = -1;
            singles.push(Ray::new(org, dir, 0.0, 1e5, lane as u32));
        }
        scene.occluded8(&valid, &mut ray8);
        for (lane, ray) in singles.iter_mut().enumerate() {
            scene.occluded1(ray);
            assert_eq!(
                ray8.tfar[lane] == f32::NEG_INFINITY,
                ray.tfar == f32::NEG_INFINITY,
                "lane {lane} disagrees with single-ray query"
            );
        }
    }

    #[test]
    fn test_rejects_mismatched_buffer() {
        let vert = flat_grid(4, 4, 0.0);
        assert!(TerrainScene::build(vert, 4, 5, GeomType::Grid).is_err());
    }
}
