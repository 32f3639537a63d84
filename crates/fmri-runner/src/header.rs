//! Scan header access: voxel zooms and array shape.

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct ScanHeader {
    pub zooms: Vec<f32>,
    pub shape: Vec<usize>,
}

impl ScanHeader {
    /// Seconds per volume, when the image has a fourth axis.
    pub fn repetition_time(&self) -> Option<f32> {
        self.zooms.get(3).copied()
    }

    pub fn frame_count(&self) -> Option<usize> {
        self.shape.get(3).copied()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("cannot read header of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not a NIfTI image (sizeof_hdr {found})")]
    NotNifti { path: PathBuf, found: i32 },
    #[error("{path} declares {dims} dimensions")]
    BadDimensions { path: PathBuf, dims: i64 },
}

pub trait HeaderReader: Send + Sync {
    fn read_header(&self, path: &Path) -> Result<ScanHeader, HeaderError>;
}

/// Reads NIfTI-1 and NIfTI-2 headers from `.nii` or `.nii.gz` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiHeaderReader;

const NIFTI1_SIZE: usize = 348;
const NIFTI2_SIZE: usize = 540;

#[derive(Clone, Copy)]
enum Order {
    Little,
    Big,
}

impl Order {
    fn i16(self, b: &[u8]) -> i16 {
        let a = [b[0], b[1]];
        match self {
            Order::Little => i16::from_le_bytes(a),
            Order::Big => i16::from_be_bytes(a),
        }
    }

    fn i32(self, b: &[u8]) -> i32 {
        let a = [b[0], b[1], b[2], b[3]];
        match self {
            Order::Little => i32::from_le_bytes(a),
            Order::Big => i32::from_be_bytes(a),
        }
    }

    fn i64(self, b: &[u8]) -> i64 {
        let mut a = [0u8; 8];
        a.copy_from_slice(&b[..8]);
        match self {
            Order::Little => i64::from_le_bytes(a),
            Order::Big => i64::from_be_bytes(a),
        }
    }

    fn f32(self, b: &[u8]) -> f32 {
        f32::from_bits(self.i32(b) as u32)
    }

    fn f64(self, b: &[u8]) -> f64 {
        f64::from_bits(self.i64(b) as u64)
    }
}

impl HeaderReader for NiftiHeaderReader {
    fn read_header(&self, path: &Path) -> Result<ScanHeader, HeaderError> {
        let io_err = |source| HeaderError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let mut reader: Box<dyn Read> = if path.to_string_lossy().ends_with(".gz") {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let mut buf = vec![0u8; NIFTI1_SIZE];
        reader.read_exact(&mut buf).map_err(io_err)?;

        let (order, size) = detect(&buf).ok_or_else(|| HeaderError::NotNifti {
            path: path.to_path_buf(),
            found: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        })?;
        if size == NIFTI2_SIZE {
            buf.resize(NIFTI2_SIZE, 0);
            reader
                .read_exact(&mut buf[NIFTI1_SIZE..])
                .map_err(io_err)?;
        }
        decode(&buf, order, size, path)
    }
}

fn detect(buf: &[u8]) -> Option<(Order, usize)> {
    for order in [Order::Little, Order::Big] {
        match order.i32(&buf[0..4]) {
            348 => return Some((order, NIFTI1_SIZE)),
            540 => return Some((order, NIFTI2_SIZE)),
            _ => {}
        }
    }
    None
}

fn decode(buf: &[u8], order: Order, size: usize, path: &Path) -> Result<ScanHeader, HeaderError> {
    // dim[8] and pixdim[8]; slot 0 of dim holds the number of used axes.
    let (dims, pixdim): (Vec<i64>, Vec<f64>) = if size == NIFTI1_SIZE {
        (
            (0..8).map(|i| order.i16(&buf[40 + 2 * i..]) as i64).collect(),
            (0..8).map(|i| order.f32(&buf[76 + 4 * i..]) as f64).collect(),
        )
    } else {
        (
            (0..8).map(|i| order.i64(&buf[16 + 8 * i..])).collect(),
            (0..8).map(|i| order.f64(&buf[104 + 8 * i..])).collect(),
        )
    };
    let ndim = dims[0];
    if !(1..=7).contains(&ndim) {
        return Err(HeaderError::BadDimensions {
            path: path.to_path_buf(),
            dims: ndim,
        });
    }
    let n = ndim as usize;
    Ok(ScanHeader {
        shape: dims[1..=n].iter().map(|d| (*d).max(0) as usize).collect(),
        zooms: pixdim[1..=n].iter().map(|z| *z as f32).collect(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::BTreeMap;
    use std::io::Write;

    /// Returns the configured header for every path; listed paths fail.
    #[derive(Default)]
    pub(crate) struct FixedHeaderReader {
        pub header: Option<ScanHeader>,
        pub failing: Vec<PathBuf>,
        pub per_file: BTreeMap<PathBuf, ScanHeader>,
    }

    impl FixedHeaderReader {
        pub fn new(zooms: &[f32], shape: &[usize]) -> Self {
            Self {
                header: Some(ScanHeader {
                    zooms: zooms.to_vec(),
                    shape: shape.to_vec(),
                }),
                ..Default::default()
            }
        }
    }

    impl HeaderReader for FixedHeaderReader {
        fn read_header(&self, path: &Path) -> Result<ScanHeader, HeaderError> {
            if self.failing.iter().any(|p| p == path) {
                return Err(HeaderError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt"),
                });
            }
            if let Some(h) = self.per_file.get(path) {
                return Ok(h.clone());
            }
            self.header.clone().ok_or_else(|| HeaderError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no header"),
            })
        }
    }

    fn nifti1_header(dims: &[i16], pixdim: &[f32]) -> Vec<u8> {
        let mut buf = vec![0u8; NIFTI1_SIZE + 4];
        buf[0..4].copy_from_slice(&348i32.to_le_bytes());
        buf[40..42].copy_from_slice(&(dims.len() as i16).to_le_bytes());
        for (i, d) in dims.iter().enumerate() {
            let off = 42 + 2 * i;
            buf[off..off + 2].copy_from_slice(&d.to_le_bytes());
        }
        for (i, p) in pixdim.iter().enumerate() {
            let off = 80 + 4 * i;
            buf[off..off + 4].copy_from_slice(&p.to_le_bytes());
        }
        buf[344..348].copy_from_slice(b"n+1\0");
        buf
    }

    #[test]
    fn reads_gzipped_nifti1_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sub-001_ses-01_task-hand_run-01_bold.nii.gz");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&nifti1_header(&[64, 64, 33, 200], &[2.0, 2.0, 2.0, 2.5]))
            .expect("encode");
        std::fs::write(&path, enc.finish().expect("finish")).expect("write");

        let header = NiftiHeaderReader.read_header(&path).expect("header");
        assert_eq!(header.shape, vec![64, 64, 33, 200]);
        assert_eq!(header.zooms, vec![2.0, 2.0, 2.0, 2.5]);
        assert_eq!(header.repetition_time(), Some(2.5));
        assert_eq!(header.frame_count(), Some(200));
    }

    #[test]
    fn three_dimensional_image_has_no_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sub-001_ses-01_T1w.nii");
        std::fs::write(&path, nifti1_header(&[176, 256, 256], &[1.0, 1.0, 1.0])).expect("write");
        let header = NiftiHeaderReader.read_header(&path).expect("header");
        assert_eq!(header.frame_count(), None);
        assert_eq!(header.repetition_time(), None);
    }

    #[test]
    fn rejects_non_nifti_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bogus.nii");
        std::fs::write(&path, vec![7u8; 400]).expect("write");
        assert!(matches!(
            NiftiHeaderReader.read_header(&path),
            Err(HeaderError::NotNifti { .. })
        ));
        let short = dir.path().join("short.nii");
        std::fs::write(&short, b"dummy data").expect("write");
        assert!(matches!(
            NiftiHeaderReader.read_header(&short),
            Err(HeaderError::Io { .. })
        ));
    }
}
