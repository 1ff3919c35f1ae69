use crate::mesh::types::{Index3, MeshData, Pt3};
use crate::mesh::voxel_grid::VoxelGrid;
use rayon::prelude::*;

/// Corner offsets of a cube cell, in the usual marching cubes numbering.
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Six tetrahedra sharing the 0-6 diagonal that tile the cube. Neighbouring
/// cells split shared faces the same way, so the surface is crack free.
const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 5, 1, 6],
    [0, 1, 2, 6],
    [0, 2, 3, 6],
    [0, 3, 7, 6],
    [0, 7, 4, 6],
    [0, 4, 5, 6],
];

/// Extract the zero isosurface of a voxel grid.
///
/// `sample` returns `(distance, weight)` for a voxel; it lets callers march the
/// raw grid or the grid seen through a displacement field. Each cube cell is
/// handled on its own and skipped unless all eight corners are observed
/// (weight > 0) and straddle the surface. Inside a cell the surface is
/// polygonised per tetrahedron, so no 256-case table is needed. Vertices are
/// placed at the world-space voxel centres of the grid.
pub fn extract_isosurface<S>(grid: &VoxelGrid, sample: S) -> MeshData
where
    S: Fn(&Index3) -> (f32, f32) + Sync,
{
    let size = grid.grid_size();
    if size.x < 2 || size.y < 2 || size.z < 2 {
        return MeshData::default();
    }

    let slabs: Vec<MeshData> = (0..size.z - 1)
        .into_par_iter()
        .map(|z| {
            let mut slab = MeshData::default();
            for y in 0..size.y - 1 {
                for x in 0..size.x - 1 {
                    process_cell(grid, &sample, Index3::new(x, y, z), &mut slab);
                }
            }
            slab
        })
        .collect();

    let mut mesh = MeshData::default();
    for slab in slabs {
        mesh.append(slab);
    }
    mesh.calculate_normals();
    mesh
}

fn process_cell<S>(grid: &VoxelGrid, sample: &S, origin: Index3, mesh: &mut MeshData)
where
    S: Fn(&Index3) -> (f32, f32),
{
    let mut positions = [Pt3::origin(); 8];
    let mut values = [0.0f32; 8];
    for (i, offset) in CORNERS.iter().enumerate() {
        let idx = origin + Index3::new(offset[0], offset[1], offset[2]);
        let (distance, weight) = sample(&idx);
        if weight <= 0.0 {
            return;
        }
        positions[i] = grid.world_position(&idx);
        values[i] = distance;
    }

    let inside = values.iter().filter(|&&v| v < 0.0).count();
    if inside == 0 || inside == 8 {
        return;
    }

    for tet in TETRAHEDRA.iter() {
        let p = tet.map(|c| positions[c]);
        let v = tet.map(|c| values[c]);
        polygonise_tetrahedron(&p, &v, mesh);
    }
}

fn polygonise_tetrahedron(p: &[Pt3; 4], v: &[f32; 4], mesh: &mut MeshData) {
    let (inside, outside): (Vec<usize>, Vec<usize>) = (0..4).partition(|&i| v[i] < 0.0);

    let edge = |a: usize, b: usize| interpolate(&p[a], &p[b], v[a], v[b]);
    let outward = centroid(p, &outside) - centroid(p, &inside);

    match inside.len() {
        1 => {
            let a = inside[0];
            let tri = [edge(a, outside[0]), edge(a, outside[1]), edge(a, outside[2])];
            push_triangle(mesh, tri, &outward);
        }
        3 => {
            let a = outside[0];
            let tri = [edge(inside[0], a), edge(inside[1], a), edge(inside[2], a)];
            push_triangle(mesh, tri, &outward);
        }
        2 => {
            let (i0, i1) = (inside[0], inside[1]);
            let (o0, o1) = (outside[0], outside[1]);
            let quad = [edge(i0, o0), edge(i0, o1), edge(i1, o1), edge(i1, o0)];
            push_triangle(mesh, [quad[0], quad[1], quad[2]], &outward);
            push_triangle(mesh, [quad[0], quad[2], quad[3]], &outward);
        }
        _ => {}
    }
}

/// Zero crossing on the edge `a -> b`
fn interpolate(a: &Pt3, b: &Pt3, va: f32, vb: f32) -> Pt3 {
    let denom = va - vb;
    if denom.abs() < 1e-12 {
        return nalgebra::center(a, b);
    }
    let t = (va / denom).clamp(0.0, 1.0);
    a + (b - a) * t
}

fn centroid(p: &[Pt3; 4], corners: &[usize]) -> nalgebra::Vector3<f32> {
    let sum = corners
        .iter()
        .fold(nalgebra::Vector3::zeros(), |acc, &c| acc + p[c].coords);
    sum / corners.len() as f32
}

/// Appends a triangle wound so its normal points from inside to outside.
fn push_triangle(mesh: &mut MeshData, tri: [Pt3; 3], outward: &nalgebra::Vector3<f32>) {
    let normal = (tri[1] - tri[0]).cross(&(tri[2] - tri[0]));
    let ordered = if normal.dot(outward) < 0.0 {
        [tri[0], tri[2], tri[1]]
    } else {
        tri
    };

    let base = mesh.vertex_count() as u32;
    for vertex in ordered.iter() {
        mesh.vertices.extend_from_slice(&[vertex.x, vertex.y, vertex.z]);
    }
    mesh.indices.extend_from_slice(&[base, base + 1, base + 2]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::mesh::sdf::sphere_sdf;
    use crate::mesh::types::Aabb;

    fn volume() -> VolumeConfig {
        VolumeConfig {
            voxel_size: 0.05,
            unknown_clip_distance: 0.2,
            truncation_distance: 0.2,
        }
    }

    #[test]
    fn sphere_vertices_lie_on_sphere() {
        let center = Pt3::new(0.5, 0.5, 0.5);
        let radius = 0.3;
        let bounds = Aabb::new(Pt3::new(0.0, 0.0, 0.0), Pt3::new(1.0, 1.0, 1.0));
        let grid = VoxelGrid::from_fn(bounds, &volume(), move |p| sphere_sdf(p, &center, radius));
        let mesh = grid.mesh();

        assert!(mesh.triangle_count() > 100);
        for p in mesh.positions() {
            let err = ((p - center).norm() - radius).abs();
            assert!(err < 0.01, "vertex {:?} is {} off the sphere", p, err);
        }
    }

    #[test]
    fn normals_point_outwards() {
        let center = Pt3::new(0.5, 0.5, 0.5);
        let bounds = Aabb::new(Pt3::new(0.0, 0.0, 0.0), Pt3::new(1.0, 1.0, 1.0));
        let grid = VoxelGrid::from_fn(bounds, &volume(), move |p| sphere_sdf(p, &center, 0.3));
        let mesh = grid.mesh();

        for tri in mesh.indices.chunks_exact(3) {
            let a = mesh.vertex(tri[0] as usize);
            let b = mesh.vertex(tri[1] as usize);
            let c = mesh.vertex(tri[2] as usize);
            let normal = (b - a).cross(&(c - a));
            if normal.norm() < 1e-6 {
                continue;
            }
            let out = a - center;
            assert!(normal.dot(&out) >= 0.0);
        }
    }

    #[test]
    fn unobserved_grid_has_no_surface() {
        let bounds = Aabb::new(Pt3::new(0.0, 0.0, 0.0), Pt3::new(1.0, 1.0, 1.0));
        let grid = VoxelGrid::new(bounds, &volume());
        assert!(grid.mesh().is_empty());
    }
}
