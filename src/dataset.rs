//! Dataset abstraction and batching for unpaired image translation.
//!
//! A dataset yields one source-domain and one target-domain image per
//! index. The pairing carries no supervision; it only fixes which target
//! images share a batch with which source images. [`DataLoader`] shuffles
//! indices with a seeded generator and collates samples into `[B, C, H, W]`
//! tensors on the training device.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array3;
use tch::{Device, Kind, Tensor};

use crate::error::{DatasetError, TrainResult};

/// One unpaired sample: a source-domain and a target-domain image, both
/// `[C, H, W]` with values in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct ImagePair {
    /// Source-domain image.
    pub source: Array3<f32>,
    /// Target-domain image.
    pub target: Array3<f32>,
}

/// Source of training pairs.
pub trait ImageDataset {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Whether the dataset holds no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the sample at `index`.
    fn get(&self, index: usize) -> Result<ImagePair, DatasetError>;

    /// Human-readable dataset name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Synthetic dataset
// ---------------------------------------------------------------------------

/// Deterministic procedural dataset for tests and smoke runs.
///
/// Source images are horizontal ramps and target images vertical ramps,
/// phase-shifted by the sample index so every index yields a distinct but
/// reproducible pair.
#[derive(Debug, Clone)]
pub struct SyntheticImageDataset {
    num_samples: usize,
    image_size: i64,
    num_channels: i64,
}

impl SyntheticImageDataset {
    /// A dataset of `num_samples` procedural pairs at the given geometry.
    pub fn new(num_samples: usize, image_size: i64, num_channels: i64) -> Self {
        SyntheticImageDataset { num_samples, image_size, num_channels }
    }
}

impl ImageDataset for SyntheticImageDataset {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn get(&self, index: usize) -> Result<ImagePair, DatasetError> {
        if index >= self.num_samples {
            return Err(DatasetError::IndexOutOfBounds { idx: index, len: self.num_samples });
        }
        let s = self.image_size as usize;
        let c = self.num_channels as usize;
        let phase = index % s;
        let ramp = |pos: usize, ch: usize| -> f32 {
            let v = ((pos + phase + ch) % s) as f32 / (s - 1).max(1) as f32;
            v * 2.0 - 1.0
        };
        let source = Array3::from_shape_fn((c, s, s), |(ch, _y, x)| ramp(x, ch));
        let target = Array3::from_shape_fn((c, s, s), |(ch, y, _x)| ramp(y, ch));
        Ok(ImagePair { source, target })
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

// ---------------------------------------------------------------------------
// Folder dataset
// ---------------------------------------------------------------------------

/// Unpaired dataset backed by two image directories.
///
/// Every file with a `.png`, `.jpg`, or `.jpeg` extension is picked up, in
/// sorted order. The two domains may hold different numbers of images; the
/// dataset length is the larger count and the shorter side wraps around.
/// Images are resized to `image_size` on load and rescaled to `[-1, 1]`.
#[derive(Debug)]
pub struct FolderDataset {
    source_paths: Vec<PathBuf>,
    target_paths: Vec<PathBuf>,
    image_size: i64,
    name: String,
}

impl FolderDataset {
    /// Scan both directories for images. Fails if either holds none.
    pub fn discover<P: AsRef<Path>>(
        source_dir: P,
        target_dir: P,
        image_size: i64,
    ) -> Result<Self, DatasetError> {
        let source_paths = list_images(source_dir.as_ref())?;
        let target_paths = list_images(target_dir.as_ref())?;
        if source_paths.is_empty() || target_paths.is_empty() {
            return Err(DatasetError::Empty);
        }
        let name = format!(
            "{}->{}",
            source_dir.as_ref().display(),
            target_dir.as_ref().display()
        );
        Ok(FolderDataset { source_paths, target_paths, image_size, name })
    }

    fn load(&self, path: &Path) -> Result<Array3<f32>, DatasetError> {
        let tensor = tch::vision::image::load_and_resize(path, self.image_size, self.image_size)
            .map_err(|e| DatasetError::IoError {
                path: path.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;
        // u8 [C, H, W] to f32 in [-1, 1].
        let tensor = tensor.to_kind(Kind::Float) / 127.5 - 1.0;
        let flat: Vec<f32> =
            Vec::try_from(tensor.reshape(-1)).map_err(|e: tch::TchError| DatasetError::IoError {
                path: path.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            })?;
        let size = self.image_size as usize;
        Array3::from_shape_vec((flat.len() / (size * size), size, size), flat).map_err(|e| {
            DatasetError::IoError {
                path: path.to_path_buf(),
                source: std::io::Error::other(e.to_string()),
            }
        })
    }
}

impl ImageDataset for FolderDataset {
    fn len(&self) -> usize {
        self.source_paths.len().max(self.target_paths.len())
    }

    fn get(&self, index: usize) -> Result<ImagePair, DatasetError> {
        if index >= self.len() {
            return Err(DatasetError::IndexOutOfBounds { idx: index, len: self.len() });
        }
        let source = self.load(&self.source_paths[index % self.source_paths.len()])?;
        let target = self.load(&self.target_paths[index % self.target_paths.len()])?;
        Ok(ImagePair { source, target })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let io_err = |e: std::io::Error| DatasetError::IoError { path: dir.to_path_buf(), source: e };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("png" | "jpg" | "jpeg")) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

// ---------------------------------------------------------------------------
// DataLoader
// ---------------------------------------------------------------------------

fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Batches a dataset with seeded shuffling.
#[derive(Debug)]
pub struct DataLoader<'a, D: ImageDataset> {
    dataset: &'a D,
    batch_size: usize,
    device: Device,
    indices: Vec<usize>,
    position: usize,
    rng_state: u64,
}

impl<'a, D: ImageDataset> DataLoader<'a, D> {
    /// Loader over `dataset` with a fixed shuffle seed. A zero seed is
    /// replaced with a fixed odd constant so the generator never sticks.
    pub fn new(
        dataset: &'a D,
        batch_size: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self, DatasetError> {
        if dataset.is_empty() {
            return Err(DatasetError::Empty);
        }
        let rng_state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Ok(DataLoader {
            dataset,
            batch_size: batch_size.max(1),
            device,
            indices: (0..dataset.len()).collect(),
            position: 0,
            rng_state,
        })
    }

    /// Number of batches per epoch, counting a trailing partial batch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Fisher-Yates shuffle of the index order, then rewind.
    pub fn shuffle(&mut self) {
        for i in (1..self.indices.len()).rev() {
            let j = (xorshift64(&mut self.rng_state) % (i as u64 + 1)) as usize;
            self.indices.swap(i, j);
        }
        self.position = 0;
    }

    /// Rewind to the start of the current index order without reshuffling.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    fn collate(&self, batch: &[(usize, ImagePair)]) -> Result<(Tensor, Tensor), DatasetError> {
        let shape = batch[0].1.source.dim();
        let mut sources = Vec::with_capacity(batch.len() * batch[0].1.source.len());
        let mut targets = Vec::with_capacity(sources.capacity());
        for (idx, pair) in batch {
            if pair.source.dim() != shape || pair.target.dim() != shape {
                return Err(DatasetError::SampleShape {
                    idx: *idx,
                    expected: vec![shape.0, shape.1, shape.2],
                    actual: vec![
                        pair.source.dim().0,
                        pair.source.dim().1,
                        pair.source.dim().2,
                    ],
                });
            }
            sources.extend(pair.source.iter().copied());
            targets.extend(pair.target.iter().copied());
        }
        let dims = [
            batch.len() as i64,
            shape.0 as i64,
            shape.1 as i64,
            shape.2 as i64,
        ];
        let source = Tensor::from_slice(&sources)
            .reshape(dims)
            .to_kind(Kind::Float)
            .to_device(self.device);
        let target = Tensor::from_slice(&targets)
            .reshape(dims)
            .to_kind(Kind::Float)
            .to_device(self.device);
        Ok((source, target))
    }
}

impl<'a, D: ImageDataset> Iterator for DataLoader<'a, D> {
    type Item = TrainResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let mut batch = Vec::with_capacity(end - self.position);
        for &idx in &self.indices[self.position..end] {
            match self.dataset.get(idx) {
                Ok(pair) => batch.push((idx, pair)),
                Err(e) => return Some(Err(e.into())),
            }
        }
        self.position = end;
        Some(self.collate(&batch).map_err(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_samples_are_deterministic() {
        let ds = SyntheticImageDataset::new(8, 16, 3);
        let a = ds.get(3).unwrap();
        let b = ds.get(3).unwrap();
        assert_eq!(a.source, b.source);
        assert_eq!(a.target, b.target);
        // Distinct indices yield distinct images.
        let c = ds.get(4).unwrap();
        assert_ne!(a.source, c.source);
    }

    #[test]
    fn synthetic_values_stay_in_range() {
        let ds = SyntheticImageDataset::new(4, 16, 3);
        let pair = ds.get(0).unwrap();
        for &v in pair.source.iter().chain(pair.target.iter()) {
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn out_of_bounds_index_is_rejected() {
        let ds = SyntheticImageDataset::new(4, 16, 3);
        assert!(matches!(ds.get(4), Err(DatasetError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn loader_covers_every_sample_once_per_epoch() {
        let ds = SyntheticImageDataset::new(7, 16, 3);
        let mut loader = DataLoader::new(&ds, 3, Device::Cpu, 42).unwrap();
        loader.shuffle();
        let mut total = 0;
        let mut batches = 0;
        for batch in &mut loader {
            let (source, target) = batch.unwrap();
            assert_eq!(source.size()[1..], [3, 16, 16]);
            assert_eq!(source.size(), target.size());
            total += source.size()[0];
            batches += 1;
        }
        assert_eq!(total, 7);
        assert_eq!(batches, 3);
    }

    #[test]
    fn same_seed_gives_same_shuffle_order() {
        let ds = SyntheticImageDataset::new(16, 16, 1);
        let mut a = DataLoader::new(&ds, 4, Device::Cpu, 7).unwrap();
        let mut b = DataLoader::new(&ds, 4, Device::Cpu, 7).unwrap();
        a.shuffle();
        b.shuffle();
        assert_eq!(a.indices, b.indices);

        let mut c = DataLoader::new(&ds, 4, Device::Cpu, 8).unwrap();
        c.shuffle();
        assert_ne!(a.indices, c.indices);
    }

    #[test]
    fn folder_dataset_wraps_the_shorter_domain() {
        let src = tempfile::tempdir().unwrap();
        let tgt = tempfile::tempdir().unwrap();
        let img = Tensor::full([3, 8, 8], 128, (Kind::Uint8, Device::Cpu));
        for i in 0..3 {
            tch::vision::image::save(&img, src.path().join(format!("s{i}.png"))).unwrap();
        }
        tch::vision::image::save(&img, tgt.path().join("t0.png")).unwrap();

        let ds = FolderDataset::discover(src.path(), tgt.path(), 8).unwrap();
        assert_eq!(ds.len(), 3);
        let pair = ds.get(2).unwrap();
        assert_eq!(pair.source.dim(), (3, 8, 8));
        for &v in pair.source.iter() {
            assert!((-1.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn folder_dataset_rejects_empty_directories() {
        let src = tempfile::tempdir().unwrap();
        let tgt = tempfile::tempdir().unwrap();
        assert!(matches!(
            FolderDataset::discover(src.path(), tgt.path(), 8),
            Err(DatasetError::Empty)
        ));
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let ds = SyntheticImageDataset::new(0, 16, 3);
        assert!(matches!(
            DataLoader::new(&ds, 2, Device::Cpu, 1),
            Err(DatasetError::Empty)
        ));
    }
}
