use std::{collections::HashMap, path::Path};

use candle_core::{safetensors::load as load_safetensors, DType, Device, Tensor};

use crate::{
    datalist::DataItem,
    error::{DataError, Result},
};

/// A channel-first `[C, H, W, D]` scan with an optional label volume sharing
/// its spatial extent. Images are stored as `f32`; labels keep their dtype.
#[derive(Debug, Clone)]
pub struct Volume {
    pub image: Tensor,
    pub label: Option<Tensor>,
}

fn channel_first(name: &str, tensor: Tensor) -> Result<Tensor> {
    match tensor.rank() {
        3 => Ok(tensor.unsqueeze(0)?),
        4 => Ok(tensor),
        _ => Err(DataError::volume(format!(
            "{name} must be [H, W, D] or [C, H, W, D], got {:?}",
            tensor.dims()
        ))),
    }
}

fn pick_tensor(mut tensors: HashMap<String, Tensor>, key: &str, path: &Path) -> Result<Tensor> {
    if let Some(tensor) = tensors.remove(key) {
        return Ok(tensor);
    }
    if tensors.len() == 1 {
        if let Some(tensor) = tensors.into_values().next() {
            return Ok(tensor);
        }
    }
    Err(DataError::volume(format!(
        "{} has no '{key}' tensor",
        path.display()
    )))
}

impl Volume {
    pub fn new(image: Tensor, label: Option<Tensor>) -> Result<Self> {
        let image = channel_first("image", image)?.to_dtype(DType::F32)?;
        let label = label.map(|label| channel_first("label", label)).transpose()?;
        if let Some(label) = &label {
            if label.dims()[1..] != image.dims()[1..] {
                return Err(DataError::volume(format!(
                    "label spatial shape {:?} differs from image {:?}",
                    &label.dims()[1..],
                    &image.dims()[1..]
                )));
            }
        }
        Ok(Self { image, label })
    }

    /// Reads the image (and label, when listed) safetensors files of a datalist item.
    pub fn load(item: &DataItem, device: &Device) -> Result<Self> {
        let image = pick_tensor(load_safetensors(&item.image, device)?, "image", &item.image)?;
        let label = match &item.label {
            Some(path) => Some(pick_tensor(load_safetensors(path, device)?, "label", path)?),
            None => None,
        };
        Self::new(image, label)
    }

    pub fn channels(&self) -> usize {
        self.image.dims()[0]
    }

    /// Spatial extent `[H, W, D]`.
    pub fn spatial_dims(&self) -> [usize; 3] {
        let dims = self.image.dims();
        [dims[1], dims[2], dims[3]]
    }

    /// Applies the same spatial operation to the image and the label.
    pub fn map_spatial(self, op: impl Fn(&Tensor) -> candle_core::Result<Tensor>) -> Result<Self> {
        let image = op(&self.image)?;
        let label = self.label.as_ref().map(&op).transpose()?;
        Ok(Self { image, label })
    }
}
