//! Dataset loading and batching
//!
//! Examples are `(index, image, [target, bias], filename)` tuples. Datasets
//! live in host memory; a `DataLoader` slices them into device batches one
//! epoch at a time.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{DebiasError, DebiasResult};

/// Column of the attribute matrix holding the target label.
pub const TARGET_ATTR: usize = 0;
/// Column of the attribute matrix holding the bias label.
pub const BIAS_ATTR: usize = 1;

#[derive(Debug, Clone)]
pub struct Example {
    pub index: usize,
    /// CHW pixels in [0, 1].
    pub image: Vec<f32>,
    pub attributes: [u32; 2],
    pub filename: String,
}

impl Example {
    pub fn target(&self) -> u32 {
        self.attributes[TARGET_ATTR]
    }

    pub fn bias(&self) -> u32 {
        self.attributes[BIAS_ATTR]
    }

    /// Target and bias co-occur as in the majority of the data.
    pub fn is_bias_aligned(&self) -> bool {
        self.target() == self.bias()
    }
}

/// A batch of examples as parallel arrays.
///
/// Batch size may differ on the final pull of an epoch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Dataset indices, `[N]` u32.
    pub indices: Tensor,
    /// `[N, C, H, W]` f32.
    pub images: Tensor,
    /// `[N, 2]` u32, columns `[target, bias]`.
    pub attributes: Tensor,
    /// Host-side only.
    pub filenames: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }

    pub fn targets(&self) -> candle_core::Result<Tensor> {
        self.attribute_column(TARGET_ATTR)
    }

    pub fn bias_labels(&self) -> candle_core::Result<Tensor> {
        self.attribute_column(BIAS_ATTR)
    }

    fn attribute_column(&self, column: usize) -> candle_core::Result<Tensor> {
        self.attributes.narrow(1, column, 1)?.squeeze(1)?.contiguous()
    }

    pub fn indices_host(&self) -> candle_core::Result<Vec<usize>> {
        Ok(self
            .indices
            .to_vec1::<u32>()?
            .into_iter()
            .map(|i| i as usize)
            .collect())
    }

    pub fn attributes_host(&self) -> candle_core::Result<Vec<Vec<u32>>> {
        self.attributes.to_vec2::<u32>()
    }

    /// Move every tensor to `device`; filenames stay on the host.
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            indices: self.indices.to_device(device)?,
            images: self.images.to_device(device)?,
            attributes: self.attributes.to_device(device)?,
            filenames: self.filenames.clone(),
        })
    }
}

pub struct InMemoryDataset {
    examples: Vec<Example>,
    image_shape: [usize; 3],
}

impl InMemoryDataset {
    /// Build from examples; indices are rewritten to row positions.
    pub fn new(mut examples: Vec<Example>, image_shape: [usize; 3]) -> DebiasResult<Self> {
        let numel: usize = image_shape.iter().product();
        for (i, example) in examples.iter_mut().enumerate() {
            if example.image.len() != numel {
                return Err(DebiasError::Dataset {
                    path: PathBuf::from(&example.filename),
                    msg: format!(
                        "image has {} values, expected {} for shape {:?}",
                        example.image.len(),
                        numel,
                        image_shape
                    ),
                });
            }
            example.index = i;
        }
        Ok(Self {
            examples,
            image_shape,
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Example> {
        self.examples.iter()
    }

    pub fn image_shape(&self) -> [usize; 3] {
        self.image_shape
    }

    /// Target label of every example, by index.
    pub fn y_array(&self) -> Vec<u32> {
        self.examples.iter().map(Example::target).collect()
    }

    /// Fraction of examples whose target and bias disagree.
    pub fn conflict_ratio(&self) -> f64 {
        if self.examples.is_empty() {
            return 0.0;
        }
        let conflicting = self.examples.iter().filter(|e| !e.is_bias_aligned()).count();
        conflicting as f64 / self.examples.len() as f64
    }

    /// Materialize the given rows as a batch on `device`.
    pub fn collate(&self, rows: &[usize], device: &Device) -> DebiasResult<Batch> {
        let [c, h, w] = self.image_shape;
        let mut indices = Vec::with_capacity(rows.len());
        let mut pixels = Vec::with_capacity(rows.len() * c * h * w);
        let mut attributes = Vec::with_capacity(rows.len() * 2);
        let mut filenames = Vec::with_capacity(rows.len());

        for &row in rows {
            let example = self.examples.get(row).ok_or(DebiasError::IndexOutOfRange {
                index: row,
                len: self.examples.len(),
            })?;
            indices.push(example.index as u32);
            pixels.extend_from_slice(&example.image);
            attributes.extend_from_slice(&example.attributes);
            filenames.push(example.filename.clone());
        }

        let n = rows.len();
        Ok(Batch {
            indices: Tensor::from_vec(indices, n, device)?,
            images: Tensor::from_vec(pixels, (n, c, h, w), device)?,
            attributes: Tensor::from_vec(attributes, (n, 2), device)?,
            filenames,
        })
    }

    /// Split into a labeled part (`ratio` of the rows) and an unlabeled
    /// remainder. Both parts are re-indexed from zero.
    pub fn split_labeled(&self, ratio: f64, seed: u64) -> DebiasResult<(Self, Self)> {
        let mut rows: Vec<usize> = (0..self.examples.len()).collect();
        rows.shuffle(&mut StdRng::seed_from_u64(seed));
        let n_labeled = ((self.examples.len() as f64) * ratio.clamp(0.0, 1.0)).ceil() as usize;

        let pick = |rows: &[usize]| -> Vec<Example> {
            let mut picked: Vec<usize> = rows.to_vec();
            picked.sort_unstable();
            picked.into_iter().map(|r| self.examples[r].clone()).collect()
        };
        let labeled = Self::new(pick(&rows[..n_labeled]), self.image_shape)?;
        let unlabeled = Self::new(pick(&rows[n_labeled..]), self.image_shape)?;
        Ok((labeled, unlabeled))
    }

    /// Load every image under `root` whose file stem ends in
    /// `_<target>_<bias>`, resized to `image_size` square.
    pub fn load_image_folder(root: impl AsRef<Path>, image_size: u32, channels: usize) -> DebiasResult<Self> {
        let root = root.as_ref();
        let mut paths = Vec::new();
        collect_images(root, &mut paths)?;
        paths.sort();
        if paths.is_empty() {
            return Err(DebiasError::Dataset {
                path: root.to_path_buf(),
                msg: "no png/jpg images found".to_string(),
            });
        }

        let mut examples = Vec::with_capacity(paths.len());
        for (index, path) in paths.into_iter().enumerate() {
            let attributes = parse_attributes(&path)?;
            let image = load_chw(&path, image_size, channels)?;
            examples.push(Example {
                index,
                image,
                attributes,
                filename: path.display().to_string(),
            });
        }
        let size = image_size as usize;
        Self::new(examples, [channels, size, size])
    }

    /// Colored-pattern data with a controllable share of bias-conflicting
    /// examples.
    ///
    /// The target is drawn as a horizontal band whose row depends on the
    /// class; the bias is a background colour. Aligned examples use
    /// `bias == target`.
    pub fn synthetic_biased(
        n: usize,
        num_classes: usize,
        conflict_ratio: f64,
        image_size: usize,
        seed: u64,
    ) -> DebiasResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let classes = num_classes.max(1) as u32;
        let band = (image_size / num_classes.max(1)).max(1);
        let plane = image_size * image_size;

        let mut examples = Vec::with_capacity(n);
        for index in 0..n {
            let target = (index as u32) % classes;
            let bias = if classes > 1 && rng.gen_bool(conflict_ratio.clamp(0.0, 1.0)) {
                (target + rng.gen_range(1..classes)) % classes
            } else {
                target
            };

            let color = bias_color(bias);
            let mut image = vec![0.0f32; 3 * plane];
            for c in 0..3 {
                for p in 0..plane {
                    let noise: f32 = rng.gen_range(-0.05..0.05);
                    image[c * plane + p] = (color[c] * 0.5 + noise).clamp(0.0, 1.0);
                }
            }
            let row0 = (target as usize * band) % image_size;
            for y in row0..(row0 + band).min(image_size) {
                for x in 0..image_size {
                    for c in 0..3 {
                        image[c * plane + y * image_size + x] = 1.0;
                    }
                }
            }

            examples.push(Example {
                index,
                image,
                attributes: [target, bias],
                filename: format!("{index}_{target}_{bias}.png"),
            });
        }
        Self::new(examples, [3, image_size, image_size])
    }
}

fn bias_color(bias: u32) -> [f32; 3] {
    let hash = |k: u32| ((bias.wrapping_mul(97).wrapping_add(k * 61)) % 255) as f32 / 255.0;
    [hash(0), hash(1), hash(2)]
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> DebiasResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| DebiasError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.is_dir() {
            collect_images(&path, out)?;
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("png" | "jpg" | "jpeg")) {
            out.push(path);
        }
    }
    Ok(())
}

/// `<anything>_<target>_<bias>.<ext>` -> `[target, bias]`
fn parse_attributes(path: &Path) -> DebiasResult<[u32; 2]> {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let mut parts = stem.rsplit('_');
    let bias = parts.next().and_then(|s| s.parse::<u32>().ok());
    let target = parts.next().and_then(|s| s.parse::<u32>().ok());
    match (target, bias) {
        (Some(target), Some(bias)) => Ok([target, bias]),
        _ => Err(DebiasError::Dataset {
            path: path.to_path_buf(),
            msg: "file name must end in _<target>_<bias>".to_string(),
        }),
    }
}

fn load_chw(path: &Path, image_size: u32, channels: usize) -> DebiasResult<Vec<f32>> {
    let img = image::open(path).map_err(|e| DebiasError::Image {
        path: path.to_path_buf(),
        source: e,
    })?;
    let img = img.resize_exact(image_size, image_size, image::imageops::FilterType::Triangle);
    let plane = (image_size * image_size) as usize;
    let mut chw = vec![0.0f32; channels * plane];

    if channels == 1 {
        for (x, y, pixel) in img.to_luma8().enumerate_pixels() {
            chw[(y * image_size + x) as usize] = pixel[0] as f32 / 255.0;
        }
    } else {
        for (x, y, pixel) in img.to_rgb8().enumerate_pixels() {
            let base = (y * image_size + x) as usize;
            for c in 0..channels.min(3) {
                chw[c * plane + base] = pixel[c] as f32 / 255.0;
            }
        }
    }
    Ok(chw)
}

/// A finite, restartable source of batches.
pub trait BatchSource {
    /// A fresh pass over the source.
    fn epoch(&self) -> DebiasResult<Box<dyn Iterator<Item = DebiasResult<Batch>>>>;

    fn num_examples(&self) -> usize;
}

pub struct DataLoader {
    dataset: Arc<InMemoryDataset>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epochs: Cell<u64>,
    device: Device,
}

impl DataLoader {
    pub fn new(dataset: Arc<InMemoryDataset>, batch_size: usize, device: Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: false,
            drop_last: false,
            seed: 0,
            epochs: Cell::new(0),
            device,
        }
    }

    /// Reshuffle every epoch, deterministically from `seed`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn dataset(&self) -> &Arc<InMemoryDataset> {
        &self.dataset
    }

    pub fn epochs_started(&self) -> u64 {
        self.epochs.get()
    }
}

impl BatchSource for DataLoader {
    fn epoch(&self) -> DebiasResult<Box<dyn Iterator<Item = DebiasResult<Batch>>>> {
        let epoch = self.epochs.get();
        self.epochs.set(epoch + 1);

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch)));
        }
        if self.drop_last {
            let full = order.len() / self.batch_size * self.batch_size;
            order.truncate(full);
        }
        Ok(Box::new(LoaderIter {
            dataset: Arc::clone(&self.dataset),
            order,
            cursor: 0,
            batch_size: self.batch_size,
            device: self.device.clone(),
        }))
    }

    fn num_examples(&self) -> usize {
        self.dataset.len()
    }
}

struct LoaderIter {
    dataset: Arc<InMemoryDataset>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    device: Device,
}

impl Iterator for LoaderIter {
    type Item = DebiasResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let rows = &self.order[self.cursor..end];
        self.cursor = end;
        Some(self.dataset.collate(rows, &self.device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_examples() -> InMemoryDataset {
        let attrs = [[0u32, 0], [1, 0], [0, 1], [1, 1]];
        let examples = attrs
            .iter()
            .enumerate()
            .map(|(i, a)| Example {
                index: 100 + i,
                image: vec![i as f32; 3 * 2 * 2],
                attributes: *a,
                filename: format!("{i}_{}_{}.png", a[0], a[1]),
            })
            .collect();
        InMemoryDataset::new(examples, [3, 2, 2]).unwrap()
    }

    #[test]
    fn test_dataset_creation() {
        let ds = four_examples();
        assert_eq!(ds.len(), 4);
        assert!(!ds.is_empty());
        assert_eq!(ds.get(2).unwrap().index, 2);
        assert_eq!(ds.y_array(), vec![0, 1, 0, 1]);
        assert_eq!(ds.conflict_ratio(), 0.5);
    }

    #[test]
    fn test_rejects_wrong_image_size() {
        let bad = Example {
            index: 0,
            image: vec![0.0; 5],
            attributes: [0, 0],
            filename: "bad".to_string(),
        };
        assert!(matches!(
            InMemoryDataset::new(vec![bad], [3, 2, 2]),
            Err(DebiasError::Dataset { .. })
        ));
    }

    #[test]
    fn test_collate_and_columns() -> anyhow::Result<()> {
        let ds = four_examples();
        let batch = ds.collate(&[3, 1], &Device::Cpu)?;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.dims(), &[2, 3, 2, 2]);
        assert_eq!(batch.indices_host()?, vec![3, 1]);
        assert_eq!(batch.targets()?.to_vec1::<u32>()?, vec![1, 1]);
        assert_eq!(batch.bias_labels()?.to_vec1::<u32>()?, vec![1, 0]);
        assert_eq!(batch.filenames[0], "3_1_1.png");
        Ok(())
    }

    #[test]
    fn test_loader_partial_tail_and_drop_last() -> anyhow::Result<()> {
        let ds = Arc::new(four_examples());
        let loader = DataLoader::new(Arc::clone(&ds), 3, Device::Cpu);
        let sizes: Vec<usize> = loader
            .epoch()?
            .map(|b| b.map(|b| b.len()))
            .collect::<DebiasResult<_>>()?;
        assert_eq!(sizes, vec![3, 1]);

        let loader = DataLoader::new(ds, 3, Device::Cpu).drop_last(true);
        assert_eq!(loader.epoch()?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_shuffled_epochs_cover_every_index() -> anyhow::Result<()> {
        let ds = Arc::new(InMemoryDataset::synthetic_biased(10, 2, 0.2, 4, 1)?);
        let loader = DataLoader::new(ds, 4, Device::Cpu).shuffled(9);
        for _ in 0..2 {
            let mut seen = Vec::new();
            for batch in loader.epoch()? {
                seen.extend(batch?.indices_host()?);
            }
            seen.sort_unstable();
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
        assert_eq!(loader.epochs_started(), 2);
        Ok(())
    }

    #[test]
    fn test_synthetic_conflict_ratio() -> anyhow::Result<()> {
        let aligned = InMemoryDataset::synthetic_biased(50, 3, 0.0, 6, 3)?;
        assert_eq!(aligned.conflict_ratio(), 0.0);
        let all_conflicting = InMemoryDataset::synthetic_biased(50, 3, 1.0, 6, 3)?;
        assert_eq!(all_conflicting.conflict_ratio(), 1.0);
        Ok(())
    }

    #[test]
    fn test_split_labeled_reindexes() -> anyhow::Result<()> {
        let ds = InMemoryDataset::synthetic_biased(10, 2, 0.1, 4, 5)?;
        let (labeled, unlabeled) = ds.split_labeled(0.3, 11)?;
        assert_eq!(labeled.len(), 3);
        assert_eq!(unlabeled.len(), 7);
        for (i, e) in labeled.iter().enumerate() {
            assert_eq!(e.index, i);
        }
        Ok(())
    }

    #[test]
    fn test_parse_attributes() {
        let ok = parse_attributes(Path::new("data/align/3/00042_3_7.png")).unwrap();
        assert_eq!(ok, [3, 7]);
        assert!(parse_attributes(Path::new("data/cat.png")).is_err());
    }

    #[test]
    fn test_load_image_folder() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sub = dir.path().join("conflict");
        fs::create_dir_all(&sub)?;
        image::RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0])).save(sub.join("0_1_0.png"))?;
        image::RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 255])).save(dir.path().join("1_0_0.png"))?;

        let ds = InMemoryDataset::load_image_folder(dir.path(), 2, 3)?;
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.image_shape(), [3, 2, 2]);
        // Sorted paths: "1_0_0.png" sorts before "conflict/...".
        assert_eq!(ds.get(0).unwrap().attributes, [0, 0]);
        assert_eq!(ds.get(1).unwrap().attributes, [1, 0]);
        assert!((ds.get(1).unwrap().image[0] - 1.0).abs() < 1e-6);
        Ok(())
    }
}
