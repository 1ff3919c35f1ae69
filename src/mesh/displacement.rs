use crate::error::{FusionError, Result};
use crate::export::{read_grid_size, read_le_values, voxel_count, write_grid_size, write_le_values};
use crate::mesh::grid_trait::Displacements;
use crate::mesh::types::{Index3, Vec3};
use std::io::{Read, Write};
use std::ops::Add;

/// Dense per-voxel displacement field (metres), co-indexed 1:1 with a `VoxelGrid`.
/// Stored flat, indexed by `x + y*nx + z*nx*ny`.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    grid_size: Index3,
    voxel_size: f32,
    data: Vec<Vec3>,
}

impl DisplacementField {
    /// All-zero field, the identity mapping.
    pub fn zeros(grid_size: Index3, voxel_size: f32) -> Self {
        Self {
            grid_size,
            voxel_size,
            data: vec![Vec3::zeros(); grid_size.x * grid_size.y * grid_size.z],
        }
    }

    /// Every voxel set to the same displacement.
    pub fn uniform(grid_size: Index3, voxel_size: f32, displacement: Vec3) -> Self {
        Self {
            grid_size,
            voxel_size,
            data: vec![displacement; grid_size.x * grid_size.y * grid_size.z],
        }
    }

    pub(crate) fn from_parts(grid_size: Index3, voxel_size: f32, data: Vec<Vec3>) -> Self {
        debug_assert_eq!(data.len(), grid_size.x * grid_size.y * grid_size.z);
        Self {
            grid_size,
            voxel_size,
            data,
        }
    }

    #[inline]
    pub fn linear_index(&self, index: &Index3) -> usize {
        index.x + index.y * self.grid_size.x + index.z * self.grid_size.x * self.grid_size.y
    }

    #[inline]
    pub fn spatial_index(&self, linear: usize) -> Index3 {
        let nx = self.grid_size.x;
        let ny = self.grid_size.y;
        Index3::new(linear % nx, (linear / nx) % ny, linear / (nx * ny))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[Vec3] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [Vec3] {
        &mut self.data
    }

    pub fn set(&mut self, index: &Index3, displacement: Vec3) {
        let i = self.linear_index(index);
        self.data[i] = displacement;
    }

    /// Adds `delta` to the displacement at `index`.
    ///
    /// Fails with `Diverged` if any component of the result is non-finite; the
    /// stored value is left as it was in that case.
    pub fn update(&mut self, index: &Index3, delta: &Vec3) -> Result<()> {
        let i = self.linear_index(index);
        let updated = self.data[i] + delta;
        ensure_finite(index, &updated)?;
        self.data[i] = updated;
        Ok(())
    }

    /// Element-wise sum `self += other`. Both fields must share a shape.
    pub fn merge(&mut self, other: &DisplacementField) -> Result<()> {
        self.check_shape(other)?;
        for (i, (value, delta)) in self.data.iter_mut().zip(&other.data).enumerate() {
            let updated = *value + delta;
            if !updated.iter().all(|c| c.is_finite()) {
                let index = self.spatial_index(i);
                return Err(diverged(&index, &updated));
            }
            *value = updated;
        }
        Ok(())
    }

    pub fn check_shape(&self, other: &DisplacementField) -> Result<()> {
        if self.grid_size != other.grid_size {
            return Err(FusionError::ShapeMismatch {
                expected: self.grid_size.into(),
                found: other.grid_size.into(),
            });
        }
        Ok(())
    }

    /// Largest displacement magnitude over all voxels.
    pub fn max_norm(&self) -> f32 {
        self.data.iter().map(|d| d.norm()).fold(0.0, f32::max)
    }

    /// Writes the binary record: grid size as three little-endian `i32`
    /// followed by `nx*ny*nz` displacement triplets as little-endian `f32`,
    /// x fastest.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_grid_size(writer, &self.grid_size)?;
        let flat = self.data.iter().flat_map(|d| [d.x, d.y, d.z]);
        write_le_values(writer, flat, f32::to_le_bytes)
    }

    pub fn dump_to_bin_file(&self, path: &std::path::Path) -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write_to(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Reads a record written by [`DisplacementField::write_to`].
    pub fn read_from<R: Read>(reader: &mut R, voxel_size: f32) -> Result<Self> {
        let grid_size = read_grid_size(reader)?;
        let components = voxel_count(&grid_size)?.checked_mul(3).ok_or_else(|| {
            FusionError::MalformedRecord(format!("grid size {:?} overflows", grid_size.as_slice()))
        })?;
        let flat = read_le_values(reader, components, f32::from_le_bytes)?;
        let data = flat
            .chunks_exact(3)
            .map(|c| Vec3::new(c[0], c[1], c[2]))
            .collect();

        Ok(Self {
            grid_size,
            voxel_size,
            data,
        })
    }
}

impl Displacements for DisplacementField {
    fn grid_size(&self) -> Index3 {
        self.grid_size
    }

    fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    #[inline]
    fn get(&self, x: usize, y: usize, z: usize) -> Vec3 {
        self.data[x + y * self.grid_size.x + z * self.grid_size.x * self.grid_size.y]
    }
}

/// Element-wise sum of two same-shape fields.
///
/// # Panics
/// If the shapes differ. Use [`DisplacementField::merge`] to get an error instead.
impl Add for &DisplacementField {
    type Output = DisplacementField;

    fn add(self, other: &DisplacementField) -> DisplacementField {
        assert_eq!(
            self.grid_size, other.grid_size,
            "displacement fields must share a shape"
        );
        DisplacementField {
            grid_size: self.grid_size,
            voxel_size: self.voxel_size,
            data: self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect(),
        }
    }
}

pub(crate) fn ensure_finite(index: &Index3, value: &Vec3) -> Result<()> {
    if value.iter().all(|c| c.is_finite()) {
        Ok(())
    } else {
        Err(diverged(index, value))
    }
}

/// Like [`ensure_finite`], and also rejects a vector longer than `limit` metres.
pub(crate) fn ensure_bounded(index: &Index3, value: &Vec3, limit: f32) -> Result<()> {
    ensure_finite(index, value)?;
    if value.norm() > limit {
        return Err(diverged(index, value));
    }
    Ok(())
}

fn diverged(index: &Index3, value: &Vec3) -> FusionError {
    FusionError::Diverged {
        index: (*index).into(),
        value: (*value).into(),
    }
}
