use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the three spatial dimensions of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Height,
    Width,
    Depth,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Height, Axis::Width, Axis::Depth];

    /// Position of the axis in `[height, width, depth]`.
    pub fn index(self) -> usize {
        match self {
            Axis::Height => 0,
            Axis::Width => 1,
            Axis::Depth => 2,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Axis::Height => "h",
            Axis::Width => "w",
            Axis::Depth => "d",
        }
    }

    /// Permutation of a `[batch, h, w, d]` tensor that moves this axis to
    /// dimension 1 and keeps the other two in their original order.
    pub fn leading_permutation(self) -> (usize, usize, usize, usize) {
        match self {
            Axis::Height => (0, 1, 2, 3),
            Axis::Width => (0, 2, 1, 3),
            Axis::Depth => (0, 3, 1, 2),
        }
    }

    /// Number of features per token: the product of the two other extents.
    pub fn slice_features(self, volume: [usize; 3]) -> usize {
        let [h, w, d] = volume;
        match self {
            Axis::Height => w * d,
            Axis::Width => h * d,
            Axis::Depth => h * w,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}
