//! Toy classification datasets, plus a reader for MNIST-style IDX files already on disk
//!
//! Generated labels are class indices. The 2D generators sample points in roughly `[-6, 6]^2`.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use rand::Rng;
use thiserror::Error;

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} has magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("{path} is truncated: header promises {expected} bytes, found {found}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("{path} holds {rows}x{cols} images, which have no pixels")]
    EmptyImages {
        path: PathBuf,
        rows: usize,
        cols: usize,
    },
    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },
}

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Line,
    Circle,
    XOR,
    Moon,
    Spiral,
}

impl Dataset {
    pub fn n_classes(&self) -> usize {
        match self {
            Dataset::Spiral => 3,
            _ => 2,
        }
    }
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::XOR => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
            Dataset::Spiral => write!(f, "spiral"),
        }
    }
}

/// Generates `class_size` samples per class of the given dataset
pub fn load_dataset<R: Rng + ?Sized>(
    dataset: Dataset,
    class_size: usize,
    rng: &mut R,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::XOR => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
        Dataset::Spiral => gen_spiral_data(class_size, 3, rng),
    }
}

/// Points on either side of the line `y = x`; class sizes are not balanced
pub fn gen_linear_data<R: Rng + ?Sized>(
    class_size: usize,
    rng: &mut R,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    (0..2 * class_size)
        .map(|_| {
            let x = rng.random_range(-5.0..5.0);
            let y = rng.random_range(-5.0..5.0);
            (vec![x, y], if x > y { 0 } else { 1 })
        })
        .unzip()
}

/// Two noisy concentric rings, radius 3 for class 0 and 5 for class 1
pub fn gen_circle_data<R: Rng + ?Sized>(
    class_size: usize,
    rng: &mut R,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut data = Vec::with_capacity(2 * class_size);
    let mut labels = Vec::with_capacity(2 * class_size);
    for (class, radius) in [(0, 3.0f32), (1, 5.0)] {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let r = radius * (1.0 + rng.random_range(-0.25..0.25));
            data.push(vec![r * angle.cos(), r * angle.sin()]);
            labels.push(class);
        }
    }
    (data, labels)
}

/// Class 0 in the first and third quadrants, class 1 elsewhere
pub fn gen_xor_data<R: Rng + ?Sized>(
    class_size: usize,
    rng: &mut R,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    (0..2 * class_size)
        .map(|_| {
            let x: f32 = rng.random_range(-5.0..5.0);
            let y: f32 = rng.random_range(-5.0..5.0);
            let class = if x * y > 0.0 { 0 } else { 1 };
            (vec![x, y], class)
        })
        .unzip()
}

/// Two interleaving half circles
pub fn gen_moon_data<R: Rng + ?Sized>(
    class_size: usize,
    rng: &mut R,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    let radius = 3.0;
    let mut data = Vec::with_capacity(2 * class_size);
    let mut labels = Vec::with_capacity(2 * class_size);
    for class in 0..2 {
        for _ in 0..class_size {
            let theta: f32 = rng.random_range(-PI / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if class == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x = rng.random_range(-0.1..0.1);
            let noise_y = rng.random_range(-0.1..0.1);
            data.push(vec![x + noise_x, y + noise_y]);
            labels.push(class);
        }
    }
    (data, labels)
}

/// `n_classes` interleaved spiral arms, one arm per class
pub fn gen_spiral_data<R: Rng + ?Sized>(
    class_size: usize,
    n_classes: usize,
    rng: &mut R,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut data = Vec::with_capacity(n_classes * class_size);
    let mut labels = Vec::with_capacity(n_classes * class_size);
    for class in 0..n_classes {
        let offset = class as f32 * 2.0 * PI / n_classes as f32;
        for i in 0..class_size {
            let t = i as f32 / class_size.max(1) as f32;
            let r = 5.0 * t;
            let theta = offset + 4.0 * t + rng.random_range(-0.2..0.2);
            data.push(vec![r * theta.cos(), r * theta.sin()]);
            labels.push(class);
        }
    }
    (data, labels)
}

/// Reads an IDX3 image file, returning one flattened `rows * cols` vector per image with
/// pixels scaled to `[0, 1]`
pub fn load_idx_images(path: impl AsRef<Path>) -> Result<Vec<Vec<f32>>, DatasetError> {
    let path = path.as_ref();
    let bytes = read_file(path)?;
    let header = parse_header(path, &bytes, IDX_IMAGES_MAGIC, 4)?;
    let (n_images, rows, cols) = (header[0], header[1], header[2]);
    let image_size = rows.saturating_mul(cols);
    if image_size == 0 {
        return Err(DatasetError::EmptyImages {
            path: path.to_path_buf(),
            rows,
            cols,
        });
    }
    let pixels = payload(path, &bytes, 16, n_images.saturating_mul(image_size))?;
    Ok(pixels
        .chunks_exact(image_size)
        .map(|image| image.iter().map(|&p| f32::from(p) / 255.0).collect())
        .collect())
}

/// Reads an IDX1 label file
pub fn load_idx_labels(path: impl AsRef<Path>) -> Result<Vec<usize>, DatasetError> {
    let path = path.as_ref();
    let bytes = read_file(path)?;
    let header = parse_header(path, &bytes, IDX_LABELS_MAGIC, 2)?;
    let labels = payload(path, &bytes, 8, header[0])?;
    Ok(labels.iter().map(|&l| usize::from(l)).collect())
}

/// Loads a matching pair of image and label files
pub fn load_idx_dataset(
    images: impl AsRef<Path>,
    labels: impl AsRef<Path>,
) -> Result<(Vec<Vec<f32>>, Vec<usize>), DatasetError> {
    let images = load_idx_images(images)?;
    let labels = load_idx_labels(labels)?;
    if images.len() != labels.len() {
        return Err(DatasetError::CountMismatch {
            images: images.len(),
            labels: labels.len(),
        });
    }
    Ok((images, labels))
}

/// `(x - mean) / std` on every feature, `Normalize((0.5,), (0.5,))` maps `[0, 1]` onto `[-1, 1]`
pub fn normalize(data: &mut [Vec<f32>], mean: f32, std: f32) {
    for x in data.iter_mut().flatten() {
        *x = (*x - mean) / std;
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, DatasetError> {
    fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Checks the magic number and returns the `n_words - 1` big-endian dimension sizes that follow it
fn parse_header(
    path: &Path,
    bytes: &[u8],
    magic: u32,
    n_words: usize,
) -> Result<Vec<usize>, DatasetError> {
    let truncated = |expected: usize| DatasetError::Truncated {
        path: path.to_path_buf(),
        expected,
        found: bytes.len(),
    };
    let words = bytes
        .chunks_exact(4)
        .take(n_words)
        .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
        .collect::<Vec<_>>();
    let Some(&found) = words.first() else {
        return Err(truncated(4));
    };
    if found != magic {
        return Err(DatasetError::BadMagic {
            path: path.to_path_buf(),
            found,
            expected: magic,
        });
    }
    if words.len() < n_words {
        return Err(truncated(4 * n_words));
    }
    Ok(words[1..].iter().map(|&w| w as usize).collect())
}

/// The `len` bytes after the header. Sizes that overflow `usize` saturate, so they are
/// reported as truncation.
fn payload<'a>(
    path: &Path,
    bytes: &'a [u8],
    offset: usize,
    len: usize,
) -> Result<&'a [u8], DatasetError> {
    let expected = offset.saturating_add(len);
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            path: path.to_path_buf(),
            expected,
            found: bytes.len(),
        });
    }
    Ok(&bytes[offset..expected])
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    fn idx_images(n: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![];
        for word in [IDX_IMAGES_MAGIC, n, rows, cols] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = vec![];
        for word in [IDX_LABELS_MAGIC, labels.len() as u32] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn test_generators_sizes_and_labels() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for dataset in [
            Dataset::Line,
            Dataset::Circle,
            Dataset::XOR,
            Dataset::Moon,
            Dataset::Spiral,
        ] {
            let (data, labels) = load_dataset(dataset, 30, &mut rng);
            assert_eq!(data.len(), 30 * dataset.n_classes(), "{}", dataset);
            assert_eq!(data.len(), labels.len());
            assert!(data.iter().all(|x| x.len() == 2));
            assert!(labels.iter().all(|&l| l < dataset.n_classes()));
        }
    }

    #[test]
    fn test_xor_labels() {
        let (data, labels) = gen_xor_data(50, &mut Pcg64Mcg::seed_from_u64(1));
        for (x, l) in data.iter().zip(labels) {
            assert_eq!(l == 0, x[0] * x[1] > 0.0);
        }
    }

    #[test]
    fn test_spiral_is_balanced() {
        let (_, labels) = gen_spiral_data(10, 4, &mut Pcg64Mcg::seed_from_u64(2));
        for class in 0..4 {
            assert_eq!(labels.iter().filter(|&&l| l == class).count(), 10);
        }
    }

    #[test]
    fn test_normalize() {
        let mut data = vec![vec![0.0, 0.5, 1.0]];
        normalize(&mut data, 0.5, 0.5);
        assert_eq!(data, vec![vec![-1.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_load_idx_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images.idx3");
        let labels = dir.path().join("labels.idx1");
        fs::write(&images, idx_images(2, 2, 2, &[0, 255, 51, 0, 255, 255, 0, 0])).unwrap();
        fs::write(&labels, idx_labels(&[7, 3])).unwrap();

        let (data, targets) = load_idx_dataset(&images, &labels).unwrap();
        assert_eq!(data, vec![vec![0.0, 1.0, 0.2, 0.0], vec![1.0, 1.0, 0.0, 0.0]]);
        assert_eq!(targets, vec![7, 3]);
    }

    #[test]
    fn test_idx_errors() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("labels.idx1");
        fs::write(&labels, idx_labels(&[1, 2, 3])).unwrap();
        // a label file is not an image file
        assert!(matches!(
            load_idx_images(&labels),
            Err(DatasetError::BadMagic { found: IDX_LABELS_MAGIC, .. })
        ));

        let images = dir.path().join("images.idx3");
        fs::write(&images, idx_images(2, 2, 2, &[0, 1, 2])).unwrap();
        assert!(matches!(
            load_idx_images(&images),
            Err(DatasetError::Truncated { expected: 24, found: 19, .. })
        ));

        fs::write(&images, idx_images(1, 1, 1, &[0])).unwrap();
        assert!(matches!(
            load_idx_dataset(&images, &labels),
            Err(DatasetError::CountMismatch { images: 1, labels: 3 })
        ));

        assert!(matches!(
            load_idx_labels(dir.path().join("missing")),
            Err(DatasetError::Io { .. })
        ));
    }

    #[test]
    fn test_idx_short_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.idx");
        fs::write(&path, [0u8, 0]).unwrap();
        assert!(matches!(
            load_idx_labels(&path),
            Err(DatasetError::Truncated { expected: 4, found: 2, .. })
        ));

        // right magic, missing dimensions
        fs::write(&path, &idx_images(1, 1, 1, &[])[..10]).unwrap();
        assert!(matches!(
            load_idx_images(&path),
            Err(DatasetError::Truncated { expected: 16, found: 10, .. })
        ));
    }

    #[test]
    fn test_idx_corrupt_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images.idx3");
        fs::write(&path, idx_images(u32::MAX, u32::MAX, u32::MAX, &[0; 8])).unwrap();
        assert!(matches!(
            load_idx_images(&path),
            Err(DatasetError::Truncated { found: 24, .. })
        ));

        fs::write(&path, idx_images(u32::MAX, 0, 28, &[])).unwrap();
        assert!(matches!(
            load_idx_images(&path),
            Err(DatasetError::EmptyImages { rows: 0, cols: 28, .. })
        ));

        let labels = dir.path().join("labels.idx1");
        let mut bytes = idx_labels(&[1, 2]);
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        fs::write(&labels, bytes).unwrap();
        assert!(matches!(
            load_idx_labels(&labels),
            Err(DatasetError::Truncated { found: 10, .. })
        ));
    }
}
