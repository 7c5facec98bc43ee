//! Minimal NIfTI-1 volume I/O.
//!
//! Reads single-file `.nii` and gzip-compressed `.nii.gz` images into
//! `ndarray` arrays in voxel (x-fastest) order, applying `scl_slope` and
//! `scl_inter`. Only what the quality metrics need is supported: no
//! two-file `.hdr/.img` pairs, no extensions, no complex or RGB types.

use crate::errors::{DtiflowError, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{ArrayD, Axis, IxDyn, ShapeBuilder};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

const HEADER_SIZE: usize = 348;
const MIN_VOX_OFFSET: usize = 352;

/// Voxel storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    /// DT_UINT8
    U8,
    /// DT_INT8
    I8,
    /// DT_INT16
    I16,
    /// DT_UINT16
    U16,
    /// DT_INT32
    I32,
    /// DT_UINT32
    U32,
    /// DT_FLOAT32
    F32,
    /// DT_FLOAT64
    F64,
}

impl Datatype {
    fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            2 => Self::U8,
            4 => Self::I16,
            8 => Self::I32,
            16 => Self::F32,
            64 => Self::F64,
            256 => Self::I8,
            512 => Self::U16,
            768 => Self::U32,
            _ => return None,
        })
    }

    fn code(self) -> i16 {
        match self {
            Self::U8 => 2,
            Self::I16 => 4,
            Self::I32 => 8,
            Self::F32 => 16,
            Self::F64 => 64,
            Self::I8 => 256,
            Self::U16 => 512,
            Self::U32 => 768,
        }
    }

    /// Bytes per voxel.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// The header fields this reader uses.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// Image dimensions, fastest-varying first.
    pub dims: Vec<usize>,
    /// Voxel type.
    pub datatype: Datatype,
    /// Byte offset of the voxel data.
    pub vox_offset: usize,
    /// Intensity scale (0 means none).
    pub scl_slope: f32,
    /// Intensity offset.
    pub scl_inter: f32,
    /// Whether multi-byte values are little endian.
    pub little_endian: bool,
}

impl NiftiHeader {
    /// Number of voxels across all dimensions; `None` if it overflows.
    #[must_use]
    pub fn voxel_count(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Byte offset just past the voxel data; `None` if it overflows.
    #[must_use]
    pub fn data_end(&self) -> Option<usize> {
        self.voxel_count()?
            .checked_mul(self.datatype.size())?
            .checked_add(self.vox_offset)
    }

    /// Volumes along the fourth axis (1 for 3-D images).
    #[must_use]
    pub fn volumes(&self) -> usize {
        self.dims.get(3).copied().unwrap_or(1)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    le: bool,
}

impl Reader<'_> {
    fn array<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&self.bytes[at..at + N]);
        buf
    }

    fn i16(&self, at: usize) -> i16 {
        let b = self.array::<2>(at);
        if self.le { i16::from_le_bytes(b) } else { i16::from_be_bytes(b) }
    }

    fn i32(&self, at: usize) -> i32 {
        let b = self.array::<4>(at);
        if self.le { i32::from_le_bytes(b) } else { i32::from_be_bytes(b) }
    }

    fn f32(&self, at: usize) -> f32 {
        let b = self.array::<4>(at);
        if self.le { f32::from_le_bytes(b) } else { f32::from_be_bytes(b) }
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let raw = std::fs::read(path)?;
    if is_gzip(path) || raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        MultiGzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| DtiflowError::volume(path, format!("gzip: {e}")))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

/// Parses the 348-byte header.
pub fn parse_header(bytes: &[u8], path: &Path) -> Result<NiftiHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(DtiflowError::volume(path, "file shorter than a NIfTI-1 header"));
    }
    let le = Reader { bytes, le: true };
    let le_ok = le.i32(0) == 348;
    let r = Reader { bytes, le: le_ok };
    if r.i32(0) != 348 {
        return Err(DtiflowError::volume(path, "sizeof_hdr is not 348"));
    }
    let magic = &bytes[344..348];
    if magic != b"n+1\0" && magic != b"ni1\0" {
        return Err(DtiflowError::volume(path, "missing NIfTI-1 magic"));
    }

    let ndim = r.i16(40);
    if !(1..=7).contains(&ndim) {
        return Err(DtiflowError::volume(path, format!("invalid dim[0] = {ndim}")));
    }
    let mut dims = Vec::with_capacity(ndim as usize);
    for i in 1..=ndim as usize {
        let d = r.i16(40 + 2 * i);
        if d < 1 {
            return Err(DtiflowError::volume(path, format!("invalid dim[{i}] = {d}")));
        }
        dims.push(d as usize);
    }

    let code = r.i16(70);
    let datatype = Datatype::from_code(code)
        .ok_or_else(|| DtiflowError::volume(path, format!("unsupported datatype {code}")))?;

    let vox_offset = r.f32(108);
    let vox_offset = if vox_offset.is_finite() && vox_offset >= MIN_VOX_OFFSET as f32 {
        vox_offset as usize
    } else {
        MIN_VOX_OFFSET
    };

    let header = NiftiHeader {
        dims,
        datatype,
        vox_offset,
        scl_slope: r.f32(112),
        scl_inter: r.f32(116),
        little_endian: le_ok,
    };
    if header.data_end().is_none() {
        return Err(DtiflowError::volume(
            path,
            format!("image size overflows: dims {:?}", header.dims),
        ));
    }
    Ok(header)
}

/// Reads only the header of a volume, decompressing no more than it needs.
pub fn read_header(path: &Path) -> Result<NiftiHeader> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let gzip = is_gzip(path) || reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    let limit = HEADER_SIZE as u64;
    let read = if gzip {
        MultiGzDecoder::new(reader).take(limit).read_to_end(&mut bytes)
    } else {
        reader.take(limit).read_to_end(&mut bytes)
    };
    read.map_err(|e| DtiflowError::volume(path, format!("reading header: {e}")))?;
    parse_header(&bytes, path)
}

/// Reads a volume as `f32` with scaling applied.
pub fn read_volume(path: &Path) -> Result<ArrayD<f32>> {
    let bytes = read_bytes(path)?;
    let header = parse_header(&bytes, path)?;

    let (Some(count), Some(end)) = (header.voxel_count(), header.data_end()) else {
        return Err(DtiflowError::volume(path, "image size overflows"));
    };
    let size = header.datatype.size();
    if bytes.len() < end {
        return Err(DtiflowError::volume(
            path,
            format!("truncated voxel data: {} bytes, expected {end}", bytes.len()),
        ));
    }

    let r = Reader {
        bytes: &bytes,
        le: header.little_endian,
    };
    let scale = header.scl_slope.is_finite() && header.scl_slope != 0.0;
    let mut data = Vec::with_capacity(count);
    for i in 0..count {
        let at = header.vox_offset + i * size;
        let value = match header.datatype {
            Datatype::U8 => f32::from(bytes[at]),
            Datatype::I8 => f32::from(bytes[at] as i8),
            Datatype::I16 => f32::from(r.i16(at)),
            Datatype::U16 => f32::from(r.i16(at) as u16),
            Datatype::I32 => r.i32(at) as f32,
            Datatype::U32 => r.i32(at) as u32 as f32,
            Datatype::F32 => r.f32(at),
            Datatype::F64 => {
                let b = r.array::<8>(at);
                let v = if r.le { f64::from_le_bytes(b) } else { f64::from_be_bytes(b) };
                v as f32
            }
        };
        data.push(if scale {
            value * header.scl_slope + header.scl_inter
        } else {
            value
        });
    }

    ArrayD::from_shape_vec(IxDyn(&header.dims).f(), data)
        .map_err(|e| DtiflowError::volume(path, format!("shape: {e}")))
}

/// Reduces a 4-D (or higher) image to its first 3-D volume.
#[must_use]
pub fn first_volume(mut volume: ArrayD<f32>) -> ArrayD<f32> {
    while volume.ndim() > 3 {
        volume = volume.index_axis_move(Axis(3), 0);
    }
    volume
}

/// Writes a little-endian float32 NIfTI-1 image (`.nii` or `.nii.gz`).
pub fn write_volume(path: &Path, volume: &ArrayD<f32>) -> Result<()> {
    let ndim = volume.ndim();
    if !(1..=7).contains(&ndim) {
        return Err(DtiflowError::volume(path, format!("cannot write {ndim}-D image")));
    }

    let mut header = vec![0u8; MIN_VOX_OFFSET];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());
    header[40..42].copy_from_slice(&(ndim as i16).to_le_bytes());
    for (i, &d) in volume.shape().iter().enumerate() {
        let d = i16::try_from(d).map_err(|_| DtiflowError::volume(path, "dimension exceeds i16"))?;
        header[42 + 2 * i..44 + 2 * i].copy_from_slice(&d.to_le_bytes());
    }
    for i in ndim..7 {
        header[42 + 2 * i..44 + 2 * i].copy_from_slice(&1i16.to_le_bytes());
    }
    header[70..72].copy_from_slice(&Datatype::F32.code().to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());
    for i in 0..4 {
        header[76 + 4 * i..80 + 4 * i].copy_from_slice(&1f32.to_le_bytes());
    }
    header[108..112].copy_from_slice(&(MIN_VOX_OFFSET as f32).to_le_bytes());
    header[344..348].copy_from_slice(b"n+1\0");

    let mut bytes = header;
    bytes.reserve(volume.len() * 4);
    // Fortran order: first axis fastest.
    for v in volume.t().iter() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if is_gzip(path) {
        let file = std::fs::File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::fast());
        encoder.write_all(&bytes)?;
        encoder.finish()?;
    } else {
        std::fs::write(path, bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let n: usize = shape.iter().product();
        Array::from_shape_vec(IxDyn(shape), (0..n).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_voxel_positions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vol.nii", "vol.nii.gz"] {
            let path = dir.path().join(name);
            let volume = ramp(&[4, 3, 2]);
            write_volume(&path, &volume).unwrap();

            let back = read_volume(&path).unwrap();
            assert_eq!(back.shape(), &[4, 3, 2]);
            assert_eq!(back[[3, 2, 1]], volume[[3, 2, 1]]);
            assert_eq!(back[[1, 0, 1]], volume[[1, 0, 1]]);
        }
    }

    #[test]
    fn test_header_dims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dwi.nii.gz");
        write_volume(&path, &ramp(&[8, 6, 4, 5])).unwrap();

        let header = read_header(&path).unwrap();
        assert_eq!(header.dims, vec![8, 6, 4, 5]);
        assert_eq!(header.volumes(), 5);
        assert_eq!(header.voxel_count(), Some(8 * 6 * 4 * 5));
        assert_eq!(header.datatype, Datatype::F32);
        assert!(header.little_endian);
    }

    #[test]
    fn test_first_volume() {
        let volume = ramp(&[2, 2, 2, 3]);
        let first = first_volume(volume.clone());
        assert_eq!(first.shape(), &[2, 2, 2]);
        assert_eq!(first[[1, 1, 1]], volume[[1, 1, 1, 0]]);
        assert_eq!(first_volume(ramp(&[2, 2])).shape(), &[2, 2]);
    }

    fn raw_header(le: bool, datatype: i16, dims: &[i16], slope: f32, inter: f32) -> Vec<u8> {
        let mut h = vec![0u8; MIN_VOX_OFFSET];
        let put16 = |h: &mut Vec<u8>, at: usize, v: i16| {
            let b = if le { v.to_le_bytes() } else { v.to_be_bytes() };
            h[at..at + 2].copy_from_slice(&b);
        };
        let put32 = |h: &mut Vec<u8>, at: usize, b: [u8; 4]| h[at..at + 4].copy_from_slice(&b);
        put32(&mut h, 0, if le { 348i32.to_le_bytes() } else { 348i32.to_be_bytes() });
        put16(&mut h, 40, dims.len() as i16);
        for (i, d) in dims.iter().enumerate() {
            put16(&mut h, 42 + 2 * i, *d);
        }
        put16(&mut h, 70, datatype);
        let f = |v: f32| if le { v.to_le_bytes() } else { v.to_be_bytes() };
        put32(&mut h, 108, f(352.0));
        put32(&mut h, 112, f(slope));
        put32(&mut h, 116, f(inter));
        h[344..348].copy_from_slice(b"n+1\0");
        h
    }

    #[test]
    fn test_big_endian_int16_with_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be.nii");
        let mut bytes = raw_header(false, 4, &[2, 1, 1], 2.0, 1.0);
        bytes.extend_from_slice(&10i16.to_be_bytes());
        bytes.extend_from_slice(&(-3i16).to_be_bytes());
        std::fs::write(&path, bytes).unwrap();

        let volume = read_volume(&path).unwrap();
        assert_eq!(volume[[0, 0, 0]], 21.0);
        assert_eq!(volume[[1, 0, 0]], -5.0);
    }

    #[test]
    fn test_uint8_without_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.nii");
        let mut bytes = raw_header(true, 2, &[3, 1, 1], 0.0, 0.0);
        bytes.extend_from_slice(&[0, 1, 255]);
        std::fs::write(&path, bytes).unwrap();

        let volume = read_volume(&path).unwrap();
        assert_eq!(volume.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 255.0]);
    }

    #[test]
    fn test_rejects_garbage_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.nii.gz");
        std::fs::write(&empty, b"").unwrap();
        assert!(read_volume(&empty).is_err());

        let short = dir.path().join("short.nii");
        let mut bytes = raw_header(true, 16, &[10, 10, 10], 0.0, 0.0);
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&short, bytes).unwrap();
        let err = read_volume(&short).unwrap_err();
        assert!(err.to_string().contains("truncated"));

        let huge = dir.path().join("huge.nii");
        std::fs::write(&huge, raw_header(true, 64, &[32767; 7], 0.0, 0.0)).unwrap();
        assert!(read_header(&huge).unwrap_err().to_string().contains("overflows"));
        assert!(read_volume(&huge).unwrap_err().to_string().contains("overflows"));

        let bad_type = dir.path().join("complex.nii");
        std::fs::write(&bad_type, raw_header(true, 32, &[1, 1, 1], 0.0, 0.0)).unwrap();
        assert!(read_volume(&bad_type).unwrap_err().to_string().contains("datatype"));
    }
}
