//! Medical Segmentation Decathlon style datalists.
//!
//! ```json
//! {
//!   "name": "BTCV",
//!   "training": [{"image": "imagesTr/img0001.safetensors", "label": "labelsTr/label0001.safetensors"}],
//!   "validation": [{"image": "imagesTr/img0035.safetensors", "label": "labelsTr/label0035.safetensors"}],
//!   "test": ["imagesTs/img0061.safetensors"]
//! }
//! ```
//!
//! Any other top-level keys are ignored. Relative paths resolve against a
//! base directory, which defaults to the datalist's own directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::{DataError, Result};

/// One image, optionally paired with its label volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub image: PathBuf,
    pub label: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Pair {
        image: PathBuf,
        #[serde(default)]
        label: Option<PathBuf>,
    },
    Image(PathBuf),
}

fn resolve(path: PathBuf, base: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path
    }
}

/// Reads the `split` list ("training", "validation", ...) of a datalist file.
pub fn load_decathlon_datalist(
    path: impl AsRef<Path>,
    split: &str,
    base_dir: Option<&Path>,
) -> Result<Vec<DataItem>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let mut root: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&contents)?;
    let entries = root.remove(split).ok_or_else(|| DataError::MissingSplit {
        split: split.to_string(),
        path: path.to_path_buf(),
    })?;
    let entries: Vec<RawEntry> = serde_json::from_value(entries)?;

    let base = base_dir
        .map(Path::to_path_buf)
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_default();

    let items: Vec<DataItem> = entries
        .into_iter()
        .map(|entry| match entry {
            RawEntry::Pair { image, label } => DataItem {
                image: resolve(image, &base),
                label: label.map(|label| resolve(label, &base)),
            },
            RawEntry::Image(image) => DataItem {
                image: resolve(image, &base),
                label: None,
            },
        })
        .collect();
    log::debug!("datalist {} split '{split}': {} items", path.display(), items.len());
    Ok(items)
}
