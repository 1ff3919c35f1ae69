use crate::error::{FusionError, Result};
use crate::mesh::{Aabb, Index3, MeshData, Pt3, VoxelGrid};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Writes `mesh` as an ASCII OFF file.
pub fn save_mesh(mesh: &MeshData, path: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    write_off(mesh, &mut out)?;
    out.flush()?;
    Ok(())
}

pub fn write_off<W: Write>(mesh: &MeshData, out: &mut W) -> Result<()> {
    writeln!(out, "OFF")?;
    writeln!(out, "{} {} 0", mesh.vertex_count(), mesh.triangle_count())?;
    for v in mesh.vertices.chunks_exact(3) {
        writeln!(out, "{} {} {}", v[0], v[1], v[2])?;
    }
    for tri in mesh.indices.chunks_exact(3) {
        writeln!(out, "3 {} {} {}", tri[0], tri[1], tri[2])?;
    }
    Ok(())
}

/// Flat little-endian dump of a voxel grid.
///
/// Layout: grid size (3 x `i32`), bounds min and max (6 x `f32`), voxel size
/// (`f32`), then every distance (`f32`) and every weight (`i64`), each in
/// storage order with x varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    pub grid_size: Index3,
    pub bounds: Aabb,
    pub voxel_size: f32,
    pub distances: Vec<f32>,
    pub weights: Vec<i64>,
}

impl VolumeRecord {
    pub fn from_grid(grid: &VoxelGrid) -> Self {
        Self {
            grid_size: grid.grid_size(),
            bounds: grid.bounds(),
            voxel_size: grid.voxel_size(),
            distances: grid.distances().to_vec(),
            weights: grid.weights().to_vec(),
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        write_grid_size(out, &self.grid_size)?;
        let header = [
            self.bounds.min.x,
            self.bounds.min.y,
            self.bounds.min.z,
            self.bounds.max.x,
            self.bounds.max.y,
            self.bounds.max.z,
            self.voxel_size,
        ];
        write_le_values(out, header, f32::to_le_bytes)?;
        write_le_values(out, self.distances.iter().copied(), f32::to_le_bytes)?;
        write_le_values(out, self.weights.iter().copied(), i64::to_le_bytes)?;
        Ok(())
    }

    /// Reads a record written by [`VolumeRecord::write_to`]. Headers whose
    /// voxel count does not fit in memory are `MalformedRecord`.
    pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let grid_size = read_grid_size(input)?;
        let header = read_le_values(input, 7, f32::from_le_bytes)?;
        let count = voxel_count(&grid_size)?;
        let distances = read_le_values(input, count, f32::from_le_bytes)?;
        let weights = read_le_values(input, count, i64::from_le_bytes)?;

        Ok(Self {
            grid_size,
            bounds: Aabb::new(
                Pt3::new(header[0], header[1], header[2]),
                Pt3::new(header[3], header[4], header[5]),
            ),
            voxel_size: header[6],
            distances,
            weights,
        })
    }
}

/// Writes the flat volume record of `grid` to `path`.
pub fn dump_volume(grid: &VoxelGrid, path: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    VolumeRecord::from_grid(grid).write_to(&mut out)?;
    out.flush()?;
    Ok(())
}

/// Grid size as three little-endian `i32`.
pub(crate) fn write_grid_size<W: Write>(out: &mut W, size: &Index3) -> Result<()> {
    write_le_values(out, size.iter().map(|&n| n as i32), i32::to_le_bytes)
}

pub(crate) fn read_grid_size<R: Read>(input: &mut R) -> Result<Index3> {
    let dims = read_le_values(input, 3, i32::from_le_bytes)?;
    if dims.iter().any(|&n| n <= 0) {
        return Err(FusionError::MalformedRecord(format!(
            "non-positive grid size {:?}",
            dims
        )));
    }
    Ok(Index3::new(dims[0] as usize, dims[1] as usize, dims[2] as usize))
}

/// `nx * ny * nz`, or `MalformedRecord` when it overflows.
pub(crate) fn voxel_count(size: &Index3) -> Result<usize> {
    size.x
        .checked_mul(size.y)
        .and_then(|n| n.checked_mul(size.z))
        .ok_or_else(|| {
            FusionError::MalformedRecord(format!("grid size {:?} overflows", size.as_slice()))
        })
}

pub(crate) fn write_le_values<W, T, I, const N: usize>(
    out: &mut W,
    values: I,
    encode: fn(T) -> [u8; N],
) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = T>,
{
    for value in values {
        out.write_all(&encode(value))?;
    }
    Ok(())
}

/// Reads `count` little-endian values. The buffer grows with the bytes
/// actually present, so a lying header cannot force a huge allocation.
pub(crate) fn read_le_values<R: Read, T, const N: usize>(
    input: &mut R,
    count: usize,
    decode: fn([u8; N]) -> T,
) -> Result<Vec<T>> {
    let expected = count.checked_mul(N).ok_or_else(|| {
        FusionError::MalformedRecord(format!("{} values of {} bytes overflow", count, N))
    })?;
    let mut payload = Vec::new();
    input.by_ref().take(expected as u64).read_to_end(&mut payload)?;
    if payload.len() != expected {
        return Err(FusionError::MalformedRecord(format!(
            "payload holds {} bytes, expected {}",
            payload.len(),
            expected
        )));
    }
    let chunks: &[[u8; N]] = bytemuck::try_cast_slice(&payload)
        .map_err(|err| FusionError::MalformedRecord(format!("{:?}", err)))?;
    Ok(chunks.iter().map(|bytes| decode(*bytes)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;

    #[test]
    fn off_lists_vertices_then_faces() {
        let mesh = MeshData {
            vertices: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            indices: vec![0, 1, 2],
            normals: Vec::new(),
        };
        let mut out = Vec::new();
        write_off(&mesh, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "OFF");
        assert_eq!(lines[1], "3 1 0");
        assert_eq!(lines[3], "1 0 0");
        assert_eq!(lines[5], "3 0 1 2");
    }

    #[test]
    fn volume_record_layout() {
        let volume = VolumeConfig {
            voxel_size: 0.5,
            unknown_clip_distance: 1.0,
            truncation_distance: 1.0,
        };
        let bounds = Aabb::new(Pt3::new(0.0, 0.0, 0.0), Pt3::new(1.0, 1.5, 0.5));
        let mut grid = VoxelGrid::new(bounds, &volume);
        grid.set_voxel(&Index3::new(1, 0, 0), -0.25, 3);

        let mut out = Vec::new();
        VolumeRecord::from_grid(&grid).write_to(&mut out).unwrap();
        // 2 x 3 x 1 voxels: 40 byte header, 6 distances, 6 weights.
        assert_eq!(out.len(), 40 + 6 * 4 + 6 * 8);
        assert_eq!(&out[0..4], &2i32.to_le_bytes());
        assert_eq!(&out[4..8], &3i32.to_le_bytes());
        assert_eq!(&out[44..48], &(-0.25f32).to_le_bytes());
        assert_eq!(&out[64 + 8..64 + 16], &3i64.to_le_bytes());

        let back = VolumeRecord::read_from(&mut out.as_slice()).unwrap();
        assert_eq!(back, VolumeRecord::from_grid(&grid));
    }

    #[test]
    fn truncated_record_is_an_error() {
        let bytes = [2u8, 0, 0, 0, 2, 0, 0, 0];
        assert!(VolumeRecord::read_from(&mut &bytes[..]).is_err());
    }

    #[test]
    fn overflowing_grid_size_is_malformed() {
        let mut bytes = Vec::new();
        for _ in 0..3 {
            bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        }
        bytes.extend_from_slice(&[0u8; 28]);
        assert!(matches!(
            VolumeRecord::read_from(&mut bytes.as_slice()),
            Err(FusionError::MalformedRecord(_))
        ));
    }

    #[test]
    fn short_payload_is_malformed() {
        let mut bytes = Vec::new();
        write_grid_size(&mut bytes, &Index3::new(2, 2, 2)).unwrap();
        bytes.extend_from_slice(&[0u8; 28 + 4]);
        assert!(matches!(
            VolumeRecord::read_from(&mut bytes.as_slice()),
            Err(FusionError::MalformedRecord(_))
        ));
    }
}
