use crate::error::Result;
use crate::mesh::displacement::{ensure_finite, DisplacementField};
use crate::mesh::grid_trait::Displacements;
use crate::mesh::types::{Index3, Vec3};
use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free mirror of a `DisplacementField` shared by the asynchronous
/// discipline. Components are stored as `f32` bit patterns.
///
/// Each voxel has exactly one writer, but readers on other threads may see a
/// neighbour before, during or after its update. That is the accepted
/// nondeterminism of the asynchronous discipline.
pub(crate) struct AtomicDisplacementField {
    grid_size: Index3,
    voxel_size: f32,
    data: Vec<[AtomicU32; 3]>,
}

impl AtomicDisplacementField {
    pub fn from_field(field: &DisplacementField) -> Self {
        let data = field
            .as_slice()
            .iter()
            .map(|d| {
                [
                    AtomicU32::new(d.x.to_bits()),
                    AtomicU32::new(d.y.to_bits()),
                    AtomicU32::new(d.z.to_bits()),
                ]
            })
            .collect();
        Self {
            grid_size: field.grid_size(),
            voxel_size: field.voxel_size(),
            data,
        }
    }

    /// Adds `delta` at `index`. Only the voxel's own worker may call this.
    pub fn update(&self, index: &Index3, delta: &Vec3) -> Result<()> {
        let updated = self.at(index) + delta;
        ensure_finite(index, &updated)?;
        let slot = &self.data[self.linear_index(index)];
        for (component, value) in slot.iter().zip(updated.iter()) {
            component.store(value.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn into_field(self) -> DisplacementField {
        let data = self
            .data
            .into_iter()
            .map(|[x, y, z]| {
                Vec3::new(
                    f32::from_bits(x.into_inner()),
                    f32::from_bits(y.into_inner()),
                    f32::from_bits(z.into_inner()),
                )
            })
            .collect();
        DisplacementField::from_parts(self.grid_size, self.voxel_size, data)
    }

    #[inline]
    fn linear_index(&self, index: &Index3) -> usize {
        index.x + index.y * self.grid_size.x + index.z * self.grid_size.x * self.grid_size.y
    }
}

impl Displacements for AtomicDisplacementField {
    fn grid_size(&self) -> Index3 {
        self.grid_size
    }

    fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    #[inline]
    fn get(&self, x: usize, y: usize, z: usize) -> Vec3 {
        let slot = &self.data[self.linear_index(&Index3::new(x, y, z))];
        Vec3::new(
            f32::from_bits(slot[0].load(Ordering::Relaxed)),
            f32::from_bits(slot[1].load(Ordering::Relaxed)),
            f32::from_bits(slot[2].load(Ordering::Relaxed)),
        )
    }
}
