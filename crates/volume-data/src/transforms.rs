//! Volume augmentation and normalisation.
//!
//! Spatial transforms act on the image and label together; intensity
//! transforms touch the image only. Random transforms draw from the
//! caller's [`StdRng`], so a seed reproduces a whole pipeline run.

use candle_core::Tensor;
use rand::{rngs::StdRng, Rng};

use crate::{config::AugmentationConfig, error::Result, volume::Volume};

pub trait VolumeTransform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Random transforms are re-run on every access and never cached.
    fn is_random(&self) -> bool {
        false
    }

    fn apply(&self, volume: Volume, rng: &mut StdRng) -> Result<Volume>;
}

/// Ordered chain of transforms.
#[derive(Default)]
pub struct Compose {
    transforms: Vec<Box<dyn VolumeTransform>>,
}

impl std::fmt::Debug for Compose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.transforms.iter().map(|t| t.name()))
            .finish()
    }
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transform: impl VolumeTransform + 'static) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Index of the first random transform; everything before it is deterministic.
    pub fn first_random(&self) -> usize {
        self.transforms
            .iter()
            .position(|t| t.is_random())
            .unwrap_or(self.transforms.len())
    }

    /// Runs `transforms[start..end]`.
    pub fn apply_range(
        &self,
        mut volume: Volume,
        start: usize,
        end: usize,
        rng: &mut StdRng,
    ) -> Result<Volume> {
        let end = end.min(self.transforms.len());
        for transform in self.transforms.iter().take(end).skip(start) {
            volume = transform.apply(volume, rng)?;
        }
        Ok(volume)
    }
}

impl VolumeTransform for Compose {
    fn name(&self) -> &'static str {
        "compose"
    }

    fn is_random(&self) -> bool {
        self.first_random() < self.transforms.len()
    }

    fn apply(&self, volume: Volume, rng: &mut StdRng) -> Result<Volume> {
        self.apply_range(volume, 0, self.transforms.len(), rng)
    }
}

/// Training chain: foreground crop padded to multiples of `roi`, random
/// `roi` crop, flips along each spatial axis, channel-wise normalisation
/// of non-zero voxels, random intensity scale and shift.
pub fn train_pipeline(roi: [usize; 3], augmentation: &AugmentationConfig) -> Compose {
    let mut pipeline = Compose::new()
        .with(CropForeground::new(roi))
        .with(RandSpatialCrop::new(roi));
    for axis in 0..3 {
        pipeline = pipeline.with(RandFlip::new(axis, augmentation.flip_prob));
    }
    pipeline
        .with(NormalizeIntensity::new(true, true))
        .with(RandScaleIntensity::new(
            augmentation.scale_factors,
            augmentation.scale_prob,
        ))
        .with(RandShiftIntensity::new(
            augmentation.shift_offsets,
            augmentation.shift_prob,
        ))
}

/// Validation and test chain: normalisation only.
pub fn eval_pipeline() -> Compose {
    Compose::new().with(NormalizeIntensity::new(true, true))
}

/// Takes `[start, start + size)` of a spatial axis, zero-padding whatever
/// falls outside the tensor.
fn crop_or_pad(tensor: &Tensor, starts: [isize; 3], sizes: [usize; 3]) -> candle_core::Result<Tensor> {
    let mut out = tensor.clone();
    for axis in 0..3 {
        let dim = axis + 1;
        let len = out.dim(dim)? as isize;
        let start = starts[axis];
        let end = start + sizes[axis] as isize;
        let lo = start.clamp(0, len);
        let hi = end.clamp(lo, len);
        out = out.narrow(dim, lo as usize, (hi - lo) as usize)?;
        let (before, after) = ((lo - start) as usize, (end - hi) as usize);
        if before > 0 || after > 0 {
            out = out.pad_with_zeros(dim, before, after)?;
        }
    }
    out.contiguous()
}

/// Uniform draw from `[-|bound|, |bound|]`; zero when the bound is zero or not finite.
fn symmetric_draw(rng: &mut StdRng, bound: f32) -> f32 {
    let bound = bound.abs();
    if bound > 0.0 && bound.is_finite() {
        rng.gen_range(-bound..=bound)
    } else {
        0.0
    }
}

fn flip(tensor: &Tensor, dim: usize) -> candle_core::Result<Tensor> {
    let len = tensor.dim(dim)?;
    let reversed: Vec<u32> = (0..len as u32).rev().collect();
    let index = Tensor::from_vec(reversed, len, tensor.device())?;
    tensor.contiguous()?.index_select(&index, dim)
}

/// Crops to the bounding box of voxels `> 0` in any image channel, grown
/// symmetrically so each extent is a multiple of `k_divisible`.
#[derive(Debug, Clone)]
pub struct CropForeground {
    pub k_divisible: [usize; 3],
}

impl CropForeground {
    pub fn new(k_divisible: [usize; 3]) -> Self {
        Self { k_divisible }
    }

    fn bounding_box(volume: &Volume) -> Result<Option<([usize; 3], [usize; 3])>> {
        let [h, w, d] = volume.spatial_dims();
        let values = volume.image.flatten_all()?.to_vec1::<f32>()?;
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        let mut found = false;
        for (flat, value) in values.iter().enumerate() {
            if *value <= 0.0 {
                continue;
            }
            let voxel = flat % (h * w * d);
            let coords = [voxel / (w * d), (voxel / d) % w, voxel % d];
            for axis in 0..3 {
                lo[axis] = lo[axis].min(coords[axis]);
                hi[axis] = hi[axis].max(coords[axis] + 1);
            }
            found = true;
        }
        Ok(found.then_some((lo, hi)))
    }
}

impl VolumeTransform for CropForeground {
    fn name(&self) -> &'static str {
        "crop_foreground"
    }

    fn apply(&self, volume: Volume, _rng: &mut StdRng) -> Result<Volume> {
        let Some((lo, hi)) = Self::bounding_box(&volume)? else {
            log::debug!("crop_foreground: no foreground voxels, volume left unchanged");
            return Ok(volume);
        };
        let mut starts = [0isize; 3];
        let mut sizes = [0usize; 3];
        for axis in 0..3 {
            let extent = hi[axis] - lo[axis];
            let k = self.k_divisible[axis];
            let target = if k > 0 { extent.div_ceil(k) * k } else { extent };
            starts[axis] = lo[axis] as isize - ((target - extent) / 2) as isize;
            sizes[axis] = target;
        }
        volume.map_spatial(|t| crop_or_pad(t, starts, sizes))
    }
}

/// Crops a fixed-size window at a uniformly random origin. Axes shorter
/// than the window are kept whole.
#[derive(Debug, Clone)]
pub struct RandSpatialCrop {
    pub roi_size: [usize; 3],
}

impl RandSpatialCrop {
    pub fn new(roi_size: [usize; 3]) -> Self {
        Self { roi_size }
    }
}

impl VolumeTransform for RandSpatialCrop {
    fn name(&self) -> &'static str {
        "rand_spatial_crop"
    }

    fn is_random(&self) -> bool {
        true
    }

    fn apply(&self, volume: Volume, rng: &mut StdRng) -> Result<Volume> {
        let dims = volume.spatial_dims();
        let mut starts = [0isize; 3];
        let mut sizes = [0usize; 3];
        for axis in 0..3 {
            let size = self.roi_size[axis].min(dims[axis]);
            starts[axis] = rng.gen_range(0..=dims[axis] - size) as isize;
            sizes[axis] = size;
        }
        volume.map_spatial(|t| crop_or_pad(t, starts, sizes))
    }
}

/// Reverses one spatial axis (0 = height, 1 = width, 2 = depth) with probability `prob`.
#[derive(Debug, Clone)]
pub struct RandFlip {
    pub spatial_axis: usize,
    pub prob: f32,
}

impl RandFlip {
    pub fn new(spatial_axis: usize, prob: f32) -> Self {
        Self { spatial_axis, prob }
    }
}

impl VolumeTransform for RandFlip {
    fn name(&self) -> &'static str {
        "rand_flip"
    }

    fn is_random(&self) -> bool {
        true
    }

    fn apply(&self, volume: Volume, rng: &mut StdRng) -> Result<Volume> {
        if rng.gen::<f32>() >= self.prob {
            return Ok(volume);
        }
        let dim = self.spatial_axis + 1;
        volume.map_spatial(|t| flip(t, dim))
    }
}

/// Zero-mean, unit-variance intensities.
///
/// With `nonzero`, statistics come from non-zero voxels and zeros stay
/// zero. With `channel_wise`, each channel gets its own statistics. A zero
/// standard deviation is treated as one.
#[derive(Debug, Clone)]
pub struct NormalizeIntensity {
    pub nonzero: bool,
    pub channel_wise: bool,
}

impl NormalizeIntensity {
    pub fn new(nonzero: bool, channel_wise: bool) -> Self {
        Self {
            nonzero,
            channel_wise,
        }
    }

    fn normalize(&self, values: &mut [f32]) {
        let selected = |v: f32| !self.nonzero || v != 0.0;
        let (count, sum) = values
            .iter()
            .filter(|v| selected(**v))
            .fold((0usize, 0f64), |(n, s), v| (n + 1, s + f64::from(*v)));
        if count == 0 {
            return;
        }
        let mean = sum / count as f64;
        let var = values
            .iter()
            .filter(|v| selected(**v))
            .map(|v| (f64::from(*v) - mean).powi(2))
            .sum::<f64>()
            / count as f64;
        let std = if var == 0.0 { 1.0 } else { var.sqrt() };
        for value in values.iter_mut().filter(|v| selected(**v)) {
            *value = ((f64::from(*value) - mean) / std) as f32;
        }
    }
}

impl VolumeTransform for NormalizeIntensity {
    fn name(&self) -> &'static str {
        "normalize_intensity"
    }

    fn apply(&self, volume: Volume, _rng: &mut StdRng) -> Result<Volume> {
        let dims = volume.image.dims().to_vec();
        let mut values = volume.image.flatten_all()?.to_vec1::<f32>()?;
        if self.channel_wise {
            let per_channel = values.len() / dims[0].max(1);
            if per_channel > 0 {
                for channel in values.chunks_mut(per_channel) {
                    self.normalize(channel);
                }
            }
        } else {
            self.normalize(&mut values);
        }
        let image = Tensor::from_vec(values, dims, volume.image.device())?;
        Ok(Volume {
            image,
            label: volume.label,
        })
    }
}

/// `v * (1 + f)` with one `f` drawn from `[-|factors|, |factors|]`, applied with probability `prob`.
#[derive(Debug, Clone)]
pub struct RandScaleIntensity {
    pub factors: f32,
    pub prob: f32,
}

impl RandScaleIntensity {
    pub fn new(factors: f32, prob: f32) -> Self {
        Self { factors, prob }
    }
}

impl VolumeTransform for RandScaleIntensity {
    fn name(&self) -> &'static str {
        "rand_scale_intensity"
    }

    fn is_random(&self) -> bool {
        true
    }

    fn apply(&self, volume: Volume, rng: &mut StdRng) -> Result<Volume> {
        if rng.gen::<f32>() >= self.prob {
            return Ok(volume);
        }
        let factor = symmetric_draw(rng, self.factors);
        Ok(Volume {
            image: volume.image.affine(1.0 + f64::from(factor), 0.0)?,
            label: volume.label,
        })
    }
}

/// `v + o` with one `o` drawn from `[-|offsets|, |offsets|]`, applied with probability `prob`.
#[derive(Debug, Clone)]
pub struct RandShiftIntensity {
    pub offsets: f32,
    pub prob: f32,
}

impl RandShiftIntensity {
    pub fn new(offsets: f32, prob: f32) -> Self {
        Self { offsets, prob }
    }
}

impl VolumeTransform for RandShiftIntensity {
    fn name(&self) -> &'static str {
        "rand_shift_intensity"
    }

    fn is_random(&self) -> bool {
        true
    }

    fn apply(&self, volume: Volume, rng: &mut StdRng) -> Result<Volume> {
        if rng.gen::<f32>() >= self.prob {
            return Ok(volume);
        }
        let offset = symmetric_draw(rng, self.offsets);
        Ok(Volume {
            image: volume.image.affine(1.0, f64::from(offset))?,
            label: volume.label,
        })
    }
}
