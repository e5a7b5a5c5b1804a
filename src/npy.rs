//! Minimal `.npy` reader and writer for tiles, masks and sample arrays.
//!
//! Only little-endian, C-ordered arrays of `u8`, `f32`, `f64` and `i64` are
//! understood; that covers what the dataset exports and the web front end
//! exchange.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use regex::Regex;
use thiserror::Error;

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

static DESCR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'descr'\s*:\s*'([^']+)'").expect("valid descr regex"));
static FORTRAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'fortran_order'\s*:\s*(True|False)").expect("valid fortran_order regex")
});
static SHAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'shape'\s*:\s*\(([^)]*)\)").expect("valid shape regex"));

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Not an npy file")]
    BadMagic,
    #[error("Unsupported npy format version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("Malformed npy header: {0}")]
    Header(String),
    #[error("Unsupported npy dtype {0}")]
    UnsupportedDtype(String),
    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,
    #[error("npy payload holds {actual} bytes, expected {expected}")]
    PayloadSize { expected: usize, actual: usize },
    #[error("Value {0} cannot be used as a class label")]
    InvalidLabel(f64),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Element type of a decoded array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    U8,
    F32,
    F64,
    I64,
}

impl NpyDtype {
    fn parse(descr: &str) -> Result<Self, NpyError> {
        match descr {
            "|u1" | "<u1" | "u1" => Ok(Self::U8),
            "<f4" => Ok(Self::F32),
            "<f8" => Ok(Self::F64),
            "<i8" => Ok(Self::I64),
            other => Err(NpyError::UnsupportedDtype(other.to_string())),
        }
    }

    fn item_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NpyData {
    U8(Vec<u8>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

/// A decoded array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: NpyData,
}

impl NpyArray {
    pub fn dtype(&self) -> NpyDtype {
        match self.data {
            NpyData::U8(_) => NpyDtype::U8,
            NpyData::F32(_) => NpyDtype::F32,
            NpyData::F64(_) => NpyDtype::F64,
            NpyData::I64(_) => NpyDtype::I64,
        }
    }

    /// Convert to an `f32` array, casting other element types.
    pub fn into_f32(self) -> Result<ArrayD<f32>, NpyError> {
        let values: Vec<f32> = match self.data {
            NpyData::U8(v) => v.into_iter().map(f32::from).collect(),
            NpyData::F32(v) => v,
            NpyData::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            NpyData::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        };
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), values)?)
    }

    /// Convert to a `u8` array, saturating other element types.
    pub fn into_u8(self) -> Result<ArrayD<u8>, NpyError> {
        let values: Vec<u8> = match self.data {
            NpyData::U8(v) => v,
            NpyData::F32(v) => v.into_iter().map(|x| x.clamp(0.0, 255.0) as u8).collect(),
            NpyData::F64(v) => v.into_iter().map(|x| x.clamp(0.0, 255.0) as u8).collect(),
            NpyData::I64(v) => v.into_iter().map(|x| x.clamp(0, 255) as u8).collect(),
        };
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), values)?)
    }

    /// Flatten into class labels; negative or fractional values are rejected.
    pub fn into_labels(self) -> Result<Vec<usize>, NpyError> {
        fn from_float(value: f64) -> Result<usize, NpyError> {
            if value < 0.0 || value.fract() != 0.0 || !value.is_finite() {
                return Err(NpyError::InvalidLabel(value));
            }
            Ok(value as usize)
        }
        match self.data {
            NpyData::U8(v) => Ok(v.into_iter().map(usize::from).collect()),
            NpyData::I64(v) => v
                .into_iter()
                .map(|x| usize::try_from(x).map_err(|_| NpyError::InvalidLabel(x as f64)))
                .collect(),
            NpyData::F32(v) => v.into_iter().map(|x| from_float(x as f64)).collect(),
            NpyData::F64(v) => v.into_iter().map(from_float).collect(),
        }
    }
}

/// Encode an `f32` array as npy format 1.0 bytes.
pub fn serialize(array: ArrayViewD<'_, f32>) -> Vec<u8> {
    let shape = match array.shape() {
        [single] => format!("({single},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let dict = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {shape}, }}");
    let unpadded = MAGIC.len() + 4 + dict.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(unpadded + padding + array.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat_n(b' ', padding));
    out.push(b'\n');
    for value in array.iter() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode npy bytes.
pub fn deserialize(bytes: &[u8]) -> Result<NpyArray, NpyError> {
    if bytes.len() < MAGIC.len() + 4 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(NpyError::BadMagic);
    }
    let (major, minor) = (bytes[6], bytes[7]);
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(NpyError::Header("truncated header length".to_string()));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            (len, 12)
        }
        _ => return Err(NpyError::UnsupportedVersion(major, minor)),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(NpyError::Header("truncated header".to_string()));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|err| NpyError::Header(err.to_string()))?;
    let (dtype, shape) = parse_header(header)?;

    let count: usize = shape.iter().product();
    let payload = &bytes[data_start..];
    let expected = count * dtype.item_size();
    if payload.len() != expected {
        return Err(NpyError::PayloadSize {
            expected,
            actual: payload.len(),
        });
    }
    let data = match dtype {
        NpyDtype::U8 => NpyData::U8(payload.to_vec()),
        NpyDtype::F32 => NpyData::F32(
            payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        NpyDtype::F64 => NpyData::F64(
            payload
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        NpyDtype::I64 => NpyData::I64(
            payload
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
    };
    Ok(NpyArray { shape, data })
}

fn parse_header(header: &str) -> Result<(NpyDtype, Vec<usize>), NpyError> {
    let descr = DESCR_RE
        .captures(header)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| NpyError::Header("missing descr".to_string()))?;
    let dtype = NpyDtype::parse(descr.as_str())?;
    let fortran = FORTRAN_RE
        .captures(header)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| NpyError::Header("missing fortran_order".to_string()))?;
    if fortran.as_str() == "True" {
        return Err(NpyError::FortranOrder);
    }
    let shape_text = SHAPE_RE
        .captures(header)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| NpyError::Header("missing shape".to_string()))?;
    let shape = shape_text
        .as_str()
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| NpyError::Header(format!("bad shape entry {part}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((dtype, shape))
}

/// Read and decode an npy file.
pub fn read_npy(path: &Path) -> Result<NpyArray, NpyError> {
    let bytes = std::fs::read(path).map_err(|source| NpyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    deserialize(&bytes)
}

/// Encode and write an `f32` array as an npy file.
pub fn write_npy(path: &Path, array: ArrayViewD<'_, f32>) -> Result<(), NpyError> {
    std::fs::write(path, serialize(array)).map_err(|source| NpyError::Write {
        path: path.to_path_buf(),
        source,
    })
}
