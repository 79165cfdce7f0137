//! Tags addressing the six blocks of the group and the wiring between them.
//!
//! First-stage tags (`h`, `w`, `d`) name the per-axis blocks. Second-stage
//! tags (`hw`, `hd`, `wd`) name the blocks applied to the product of two
//! first-stage outputs; [`Stage::PAIRS`] is the single source of that wiring.

use std::{fmt, ops::Index};

use embedding::Axis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    H,
    W,
    D,
    HW,
    HD,
    WD,
}

impl Stage {
    pub const ALL: [Stage; 6] = [Stage::H, Stage::W, Stage::D, Stage::HW, Stage::HD, Stage::WD];

    /// Per-axis blocks, in `[height, width, depth]` order.
    pub const FIRST: [Stage; 3] = [Stage::H, Stage::W, Stage::D];

    pub const SECOND: [Stage; 3] = [Stage::HW, Stage::HD, Stage::WD];

    /// `(second-stage block, left operand, right operand)`.
    pub const PAIRS: [(Stage, Stage, Stage); 3] = [
        (Stage::HW, Stage::H, Stage::W),
        (Stage::HD, Stage::H, Stage::D),
        (Stage::WD, Stage::W, Stage::D),
    ];

    pub fn index(self) -> usize {
        match self {
            Stage::H => 0,
            Stage::W => 1,
            Stage::D => 2,
            Stage::HW => 3,
            Stage::HD => 4,
            Stage::WD => 5,
        }
    }

    pub fn is_first(self) -> bool {
        self.index() < 3
    }

    pub fn for_axis(axis: Axis) -> Stage {
        Stage::FIRST[axis.index()]
    }

    /// Axis consumed by a first-stage block.
    pub fn axis(self) -> Option<Axis> {
        match self {
            Stage::H => Some(Axis::Height),
            Stage::W => Some(Axis::Width),
            Stage::D => Some(Axis::Depth),
            _ => None,
        }
    }

    /// First-stage blocks whose outputs are multiplied to feed this block.
    pub fn operands(self) -> Option<(Stage, Stage)> {
        Self::PAIRS
            .iter()
            .find(|(pair, _, _)| *pair == self)
            .map(|(_, left, right)| (*left, *right))
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::H => "h",
            Stage::W => "w",
            Stage::D => "d",
            Stage::HW => "hw",
            Stage::HD => "hd",
            Stage::WD => "wd",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fixed-size table holding one value per [`Stage`].
#[derive(Debug, Clone)]
pub struct Stages<T> {
    slots: [T; 6],
}

impl<T> Stages<T> {
    pub fn from_fn(mut f: impl FnMut(Stage) -> T) -> Self {
        Self {
            slots: Stage::ALL.map(&mut f),
        }
    }

    pub fn try_from_fn<E>(mut f: impl FnMut(Stage) -> Result<T, E>) -> Result<Self, E> {
        let [h, w, d, hw, hd, wd] = Stage::ALL.map(&mut f);
        Ok(Self {
            slots: [h?, w?, d?, hw?, hd?, wd?],
        })
    }

    /// Assembles a table from first-stage and second-stage values.
    pub fn from_stages(first: [T; 3], second: [T; 3]) -> Self {
        let [h, w, d] = first;
        let [hw, hd, wd] = second;
        Self {
            slots: [h, w, d, hw, hd, wd],
        }
    }

    pub fn get(&self, stage: Stage) -> &T {
        &self.slots[stage.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &T)> {
        Stage::ALL.into_iter().zip(self.slots.iter())
    }
}

impl<T> Index<Stage> for Stages<T> {
    type Output = T;

    fn index(&self, stage: Stage) -> &T {
        self.get(stage)
    }
}
