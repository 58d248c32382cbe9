//! Paired try-on dataset and the rank-sharded, epoch-seeded sampler.
//!
//! Layout on disk: `<root>/image/*` holds the target person photos and
//! `<root>/cloth/*` the garment photos, matched by file stem. Every item
//! yields the person pixels and garment pixels in [-1, 1] at training
//! resolution, a CLIP-normalized garment view, and a per-sample
//! classifier-free-guidance dropout flag.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

const CLIP_SIZE: usize = 224;
const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// One training batch; all tensors are aligned on the batch dimension.
pub struct VtonBatch {
    /// Target person images, `[b, 3, h, w]` in [-1, 1].
    pub pixel_values: Tensor,
    /// Garment images for the latent branch, `[b, 3, h, w]` in [-1, 1].
    pub pixel_values_ref: Tensor,
    /// Garment images preprocessed for the CLIP reference encoder,
    /// `[b, 3, 224, 224]`.
    pub clip_ref_image: Tensor,
    /// Per-sample CFG dropout indicator, `[b]`, 1.0 = drop conditioning.
    pub drop_image_embeds: Tensor,
}

struct PairedItem {
    person: PathBuf,
    cloth: PathBuf,
}

pub struct VtonDataset {
    items: Vec<PairedItem>,
    height: usize,
    width: usize,
    cfg_dropout_ratio: f32,
    seed: u64,
}

impl VtonDataset {
    pub fn new(
        root: &Path,
        resolution: [usize; 2],
        cfg_dropout_ratio: f32,
        seed: u64,
    ) -> Result<Self> {
        let person_dir = root.join("image");
        let cloth_dir = root.join("cloth");
        if !person_dir.is_dir() || !cloth_dir.is_dir() {
            bail!(
                "dataset root {} must contain `image/` and `cloth/` directories",
                root.display()
            );
        }

        let mut items = Vec::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&person_dir)
            .with_context(|| format!("failed to list {}", person_dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_image(p))
            .collect();
        entries.sort();

        for person in entries {
            let stem = person
                .file_stem()
                .and_then(|s| s.to_str())
                .context("non-utf8 file name in dataset")?
                .to_string();
            let cloth = find_with_stem(&cloth_dir, &stem).with_context(|| {
                format!("no garment image for `{stem}` in {}", cloth_dir.display())
            })?;
            items.push(PairedItem { person, cloth });
        }

        if items.is_empty() {
            bail!("dataset at {} contains no image pairs", root.display());
        }

        Ok(Self {
            items,
            height: resolution[0],
            width: resolution[1],
            cfg_dropout_ratio,
            seed,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Decode and assemble one batch. Image decode runs in parallel; the
    /// tensors are materialized on `device` afterwards.
    pub fn get_batch(&self, indices: &[usize], epoch: usize, device: &Device) -> Result<VtonBatch> {
        let decoded: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = indices
            .par_iter()
            .map(|&i| {
                let item = &self.items[i];
                let person = load_normalized(&item.person, self.height, self.width)?;
                let cloth = load_normalized(&item.cloth, self.height, self.width)?;
                let clip = load_clip_normalized(&item.cloth)?;
                Ok((person, cloth, clip))
            })
            .collect::<Result<_>>()?;

        let b = indices.len();
        let mut person_data = Vec::with_capacity(b * 3 * self.height * self.width);
        let mut cloth_data = Vec::with_capacity(b * 3 * self.height * self.width);
        let mut clip_data = Vec::with_capacity(b * 3 * CLIP_SIZE * CLIP_SIZE);
        for (person, cloth, clip) in decoded {
            person_data.extend(person);
            cloth_data.extend(cloth);
            clip_data.extend(clip);
        }

        let drop_flags: Vec<f32> = indices
            .iter()
            .map(|&i| {
                if sample_drop_flag(self.seed, epoch, i, self.cfg_dropout_ratio) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();

        Ok(VtonBatch {
            pixel_values: Tensor::from_vec(
                person_data,
                &[b, 3, self.height, self.width],
                device,
            )?,
            pixel_values_ref: Tensor::from_vec(
                cloth_data,
                &[b, 3, self.height, self.width],
                device,
            )?,
            clip_ref_image: Tensor::from_vec(clip_data, &[b, 3, CLIP_SIZE, CLIP_SIZE], device)?,
            drop_image_embeds: Tensor::from_vec(drop_flags, &[b], device)?,
        })
    }
}

/// Deterministic per-(epoch, sample) CFG dropout decision.
fn sample_drop_flag(seed: u64, epoch: usize, index: usize, ratio: f32) -> bool {
    if ratio <= 0.0 {
        return false;
    }
    let mixed = seed
        .wrapping_add((epoch as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add((index as u64).wrapping_mul(0xbf58_476d_1ce4_e5b9));
    let mut rng = StdRng::seed_from_u64(mixed);
    rng.gen::<f32>() < ratio
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn find_with_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|p| p.is_file())
}

/// Decode an image, resize and map to [-1, 1], channel-first layout.
fn load_normalized(path: &Path, height: usize, width: usize) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_rgb8();

    let mut data = vec![0.0f32; 3 * height * width];
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            data[c * height * width + y * width + x] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    Ok(data)
}

/// CLIP preprocessing: 224x224, per-channel mean/std normalization.
fn load_clip_normalized(path: &Path) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .resize_exact(CLIP_SIZE as u32, CLIP_SIZE as u32, FilterType::Triangle)
        .to_rgb8();

    let mut data = vec![0.0f32; 3 * CLIP_SIZE * CLIP_SIZE];
    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            data[c * CLIP_SIZE * CLIP_SIZE + y * CLIP_SIZE + x] = (v - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    Ok(data)
}

/// Epoch-seeded shuffling plus rank-strided sharding with drop-last.
///
/// All processes shuffle with the identical `seed + epoch` stream, then each
/// takes every `world_size`-th index starting at its rank, so the shards are
/// disjoint and cover the same permutation on every process.
pub struct ShardedSampler {
    dataset_len: usize,
    world_size: usize,
    rank: usize,
    seed: u64,
    batch_size: usize,
}

impl ShardedSampler {
    pub fn new(
        dataset_len: usize,
        world_size: usize,
        rank: usize,
        seed: u64,
        batch_size: usize,
    ) -> Self {
        assert!(rank < world_size, "rank {rank} outside world size {world_size}");
        Self { dataset_len, world_size, rank, seed, batch_size }
    }

    /// This rank's indices for one epoch, truncated to whole batches.
    ///
    /// Every rank truncates to the shortest shard, so all processes run the
    /// same number of steps per epoch and stay in lockstep through the
    /// synchronized optimizer step.
    pub fn epoch_indices(&self, epoch: usize) -> Vec<usize> {
        let mut all: Vec<usize> = (0..self.dataset_len).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        all.shuffle(&mut rng);

        let per_rank = self.dataset_len / self.world_size;
        let shard_len = per_rank / self.batch_size * self.batch_size;
        all.into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .take(shard_len)
            .collect()
    }

    /// Number of batches each rank sees per epoch.
    pub fn batches_per_epoch(&self) -> usize {
        let per_rank = self.dataset_len / self.world_size;
        per_rank / self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shards_are_disjoint_and_cover_the_epoch() {
        let world = 4;
        let samplers: Vec<ShardedSampler> = (0..world)
            .map(|rank| ShardedSampler::new(103, world, rank, 42, 2))
            .collect();

        let mut seen = HashSet::new();
        for sampler in &samplers {
            for i in sampler.epoch_indices(0) {
                assert!(seen.insert(i), "index {i} appeared in two shards");
            }
        }
        // 103 items over 4 ranks -> floor to 25 per rank, truncated to 24
        // whole-batch items each for batch size 2.
        assert_eq!(seen.len(), world * 24);
    }

    #[test]
    fn test_all_ranks_agree_on_steps_per_epoch() {
        // 103 items over 4 ranks leaves 3 ranks with a spare item; every
        // rank must still see the same shard length or the job deadlocks at
        // the first gradient synchronization of the shorter ranks' epoch.
        let world = 4;
        for batch_size in [1, 2] {
            let samplers: Vec<ShardedSampler> = (0..world)
                .map(|rank| ShardedSampler::new(103, world, rank, 42, batch_size))
                .collect();
            let lengths: Vec<usize> = samplers
                .iter()
                .map(|s| s.epoch_indices(0).len())
                .collect();
            assert!(
                lengths.windows(2).all(|w| w[0] == w[1]),
                "per-rank epoch lengths diverge: {lengths:?}"
            );
            for sampler in &samplers {
                assert_eq!(
                    sampler.epoch_indices(0).len(),
                    sampler.batches_per_epoch() * batch_size
                );
            }
        }
    }

    #[test]
    fn test_epoch_reshuffle_is_deterministic() {
        let a = ShardedSampler::new(50, 1, 0, 7, 5);
        let b = ShardedSampler::new(50, 1, 0, 7, 5);
        assert_eq!(a.epoch_indices(3), b.epoch_indices(3));
        assert_ne!(a.epoch_indices(0), a.epoch_indices(1));
    }

    #[test]
    fn test_drop_last_truncates_to_whole_batches() {
        let sampler = ShardedSampler::new(10, 1, 0, 0, 4);
        assert_eq!(sampler.epoch_indices(0).len(), 8);
        assert_eq!(sampler.batches_per_epoch(), 2);
    }

    #[test]
    fn test_drop_flags_are_deterministic_and_ratio_bound() {
        let hits: Vec<bool> = (0..2000)
            .map(|i| sample_drop_flag(42, 1, i, 0.1))
            .collect();
        let again: Vec<bool> = (0..2000)
            .map(|i| sample_drop_flag(42, 1, i, 0.1))
            .collect();
        assert_eq!(hits, again);

        let ratio = hits.iter().filter(|&&h| h).count() as f32 / hits.len() as f32;
        assert!((ratio - 0.1).abs() < 0.03, "observed dropout ratio {ratio}");

        assert!((0..100).all(|i| !sample_drop_flag(42, 0, i, 0.0)));
    }

    #[test]
    fn test_dataset_pairs_and_batch_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("image")).unwrap();
        std::fs::create_dir_all(root.join("cloth")).unwrap();
        for i in 0..3 {
            let img = image::RgbImage::from_pixel(16, 16, image::Rgb([128, (i * 80) as u8, 30]));
            img.save(root.join("image").join(format!("{i:05}.png"))).unwrap();
            img.save(root.join("cloth").join(format!("{i:05}.png"))).unwrap();
        }

        let dataset = VtonDataset::new(root, [16, 16], 0.5, 42).unwrap();
        assert_eq!(dataset.len(), 3);

        let batch = dataset.get_batch(&[0, 2], 0, &Device::Cpu).unwrap();
        assert_eq!(batch.pixel_values.dims(), &[2, 3, 16, 16]);
        assert_eq!(batch.pixel_values_ref.dims(), &[2, 3, 16, 16]);
        assert_eq!(batch.clip_ref_image.dims(), &[2, 3, 224, 224]);
        assert_eq!(batch.drop_image_embeds.dims(), &[2]);

        // Mid-gray input maps close to zero under [-1, 1] normalization.
        let v = batch.pixel_values.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(v[0].abs() < 0.01);
    }

    #[test]
    fn test_unpaired_person_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("image")).unwrap();
        std::fs::create_dir_all(root.join("cloth")).unwrap();
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([0, 0, 0]));
        img.save(root.join("image").join("lonely.png")).unwrap();

        assert!(VtonDataset::new(root, [8, 8], 0.0, 0).is_err());
    }
}
