use glam::DVec3;

/// Rotate `v` about the unit axis `k` by `theta` radians (Rodrigues'
/// rotation formula). `k` must be normalised by the caller.
#[inline]
pub fn rotate_axis_angle(k: DVec3, theta: f64, v: DVec3) -> DVec3 {
    let cos_theta = theta.cos();
    let sin_theta = theta.sin();
    v * cos_theta + k.cross(v) * sin_theta + k * (k.dot(v) * (1.0 - cos_theta))
}

/// Surface normal and area of a triangle.
///
/// The normal is `(v2 - v1) x (v0 - v1)`, normalised; the area is half the
/// magnitude of that cross product. With the lower-left/upper-right pixel
/// triangulation below this winding yields upward-pointing normals for a
/// flat DEM, which the self-shadowing tests rely on.
#[inline]
pub fn triangle_normal_area(v0: DVec3, v1: DVec3, v2: DVec3) -> (DVec3, f64) {
    let norm = (v2 - v1).cross(v0 - v1);
    let mag = norm.length();
    (norm / mag, mag / 2.0)
}

/// Arithmetic mean of the three triangle vertices.
#[inline]
pub fn triangle_centroid(v0: DVec3, v1: DVec3, v2: DVec3) -> DVec3 {
    (v0 + v1 + v2) / 3.0
}

/// Float offsets of the lower-left triangle vertices of pixel
/// `(ind_0, ind_1)` in a flat row-major (x, y, z) vertex buffer with
/// `dim_1` vertex columns.
#[inline]
pub fn tri_vert_ll(dim_1: usize, ind_0: usize, ind_1: usize) -> [usize; 3] {
    [
        (ind_0 * dim_1 + ind_1) * 3,
        (ind_0 * dim_1 + ind_1 + 1) * 3,
        ((ind_0 + 1) * dim_1 + ind_1) * 3,
    ]
}

/// Float offsets of the upper-right triangle vertices of pixel
/// `(ind_0, ind_1)`.
#[inline]
pub fn tri_vert_ur(dim_1: usize, ind_0: usize, ind_1: usize) -> [usize; 3] {
    [
        (ind_0 * dim_1 + ind_1 + 1) * 3,
        ((ind_0 + 1) * dim_1 + ind_1 + 1) * 3,
        ((ind_0 + 1) * dim_1 + ind_1) * 3,
    ]
}

/// Dispatch table over the two sub-triangles of a pixel, indexed by the
/// sub-triangle id `n` of the innermost pixel loop.
pub const TRI_VERT: [fn(usize, usize, usize) -> [usize; 3]; 2] = [tri_vert_ll, tri_vert_ur];

/// Read one vertex from a flat `f32` buffer at a float offset, widening to
/// `f64` for all downstream geometry.
#[inline]
pub fn fetch_vertex(vert_grid: &[f32], ind: usize) -> DVec3 {
    DVec3::new(
        vert_grid[ind] as f64,
        vert_grid[ind + 1] as f64,
        vert_grid[ind + 2] as f64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_quarter_turn() {
        let v = DVec3::new(1.0, 0.0, 0.0);
        let k = DVec3::new(0.0, 0.0, 1.0);
        let r = rotate_axis_angle(k, std::f64::consts::FRAC_PI_2, v);
        assert!((r - DVec3::new(0.0, 1.0, 0.0)).length() < 1e-12);
    }

    #[test]
    fn test_rotate_preserves_axis() {
        let k = DVec3::new(0.0, 1.0, 0.0);
        let r = rotate_axis_angle(k, 1.234, k);
        assert!((r - k).length() < 1e-12);
    }

    #[test]
    fn test_flat_triangle_normal_points_up() {
        // Lower-left triangle of a unit pixel in the z = 0 plane
        let v0 = DVec3::new(0.0, 0.0, 0.0);
        let v1 = DVec3::new(1.0, 0.0, 0.0);
        let v2 = DVec3::new(0.0, 1.0, 0.0);
        let (norm, area) = triangle_normal_area(v0, v1, v2);
        assert!((norm - DVec3::new(0.0, 0.0, 1.0)).length() < 1e-12);
        assert!((area - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_tilted_triangle_area() {
        // 45 degree tilt enlarges the area by sqrt(2)
        let v0 = DVec3::new(0.0, 0.0, 0.0);
        let v1 = DVec3::new(1.0, 0.0, 0.0);
        let v2 = DVec3::new(0.0, 1.0, 1.0);
        let (_, area) = triangle_normal_area(v0, v1, v2);
        assert!((area - 0.5 * 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_centroid() {
        let c = triangle_centroid(
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(3.0, 0.0, 0.0),
            DVec3::new(0.0, 3.0, 3.0),
        );
        assert!((c - DVec3::new(1.0, 1.0, 1.0)).length() < 1e-12);
    }

    #[test]
    fn test_tri_vert_offsets() {
        // 4-column grid, pixel (1, 2)
        assert_eq!(tri_vert_ll(4, 1, 2), [18, 21, 30]);
        assert_eq!(tri_vert_ur(4, 1, 2), [21, 33, 30]);
        // both sub-triangles share the pixel diagonal (i, j+1)-(i+1, j)
        assert_eq!(tri_vert_ll(4, 1, 2)[1], tri_vert_ur(4, 1, 2)[0]);
        assert_eq!(tri_vert_ll(4, 1, 2)[2], tri_vert_ur(4, 1, 2)[2]);
    }

    #[test]
    fn test_fetch_vertex() {
        let grid = [0.0_f32, 1.0, 2.0, 3.0, 4.0, 5.0];
        let v = fetch_vertex(&grid, 3);
        assert_eq!(v, DVec3::new(3.0, 4.0, 5.0));
    }
}
