use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

pub type Pt3 = Point3<f32>;
pub type Vec3 = Vector3<f32>;

/// Integer voxel coordinates `(x, y, z)`.
pub type Index3 = Vector3<usize>;

/// Axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Pt3,
    pub max: Pt3,
}

impl Aabb {
    /// Builds a box from two opposite corners, normalising so that `min <= max` per axis.
    pub fn new(a: Pt3, b: Pt3) -> Self {
        Self {
            min: Pt3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Pt3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Smallest box containing every point. Returns `None` for an empty slice.
    pub fn from_points(points: &[Pt3]) -> Option<Self> {
        let first = points.first()?;
        let mut min = *first;
        let mut max = *first;
        for p in &points[1..] {
            min = Pt3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
            max = Pt3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        }
        Some(Self { min, max })
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn center(&self) -> Pt3 {
        nalgebra::center(&self.min, &self.max)
    }
}

/// Triangle mesh produced by isosurface extraction.
///
/// Positions and normals are flattened `xyz` triplets, indices are triangle lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshData {
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub normals: Vec<f32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn vertex(&self, i: usize) -> Pt3 {
        Pt3::new(
            self.vertices[i * 3],
            self.vertices[i * 3 + 1],
            self.vertices[i * 3 + 2],
        )
    }

    pub fn positions(&self) -> impl Iterator<Item = Pt3> + '_ {
        self.vertices
            .chunks_exact(3)
            .map(|v| Pt3::new(v[0], v[1], v[2]))
    }

    /// Appends `other`, re-basing its indices.
    pub fn append(&mut self, other: MeshData) {
        let base = self.vertex_count() as u32;
        self.vertices.extend(other.vertices);
        self.normals.extend(other.normals);
        self.indices.extend(other.indices.into_iter().map(|i| i + base));
    }

    /// Recomputes per-vertex normals by accumulating face normals.
    pub fn calculate_normals(&mut self) {
        let mut normals = vec![Vec3::zeros(); self.vertex_count()];

        for chunk in self.indices.chunks_exact(3) {
            let i0 = chunk[0] as usize;
            let i1 = chunk[1] as usize;
            let i2 = chunk[2] as usize;

            let v0 = self.vertex(i0);
            let edge1 = self.vertex(i1) - v0;
            let edge2 = self.vertex(i2) - v0;
            let normal = edge1.cross(&edge2);

            normals[i0] += normal;
            normals[i1] += normal;
            normals[i2] += normal;
        }

        self.normals = normals
            .into_iter()
            .flat_map(|n| {
                let n = n.try_normalize(1e-12).unwrap_or_else(Vec3::zeros);
                [n.x, n.y, n.z]
            })
            .collect();
    }
}
