use crate::bits::{bit_offsets_for, bytes_for_bits, total_bits};
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const MUSCLE_COUNT: usize = 95;

/// Fidelity preset. Ordering follows fidelity, so `High > VeryLow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Quality {
    VeryLow = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Quality {
    pub const ALL: [Quality; 4] = [Quality::VeryLow, Quality::Low, Quality::Medium, Quality::High];

    /// The qualities the repacker derives from a `High` source.
    pub const DERIVED: [Quality; 3] = [Quality::Medium, Quality::Low, Quality::VeryLow];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Quality::VeryLow),
            1 => Ok(Quality::Low),
            2 => Ok(Quality::Medium),
            3 => Ok(Quality::High),
            other => Err(RelayError::UnknownQuality(other)),
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn layout(self) -> &'static QualityLayout {
        &layouts()[self.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuscleGroup {
    Torso,
    Head,
    Face,
    Leg,
    Arm,
    Finger,
}

impl MuscleGroup {
    pub fn range(self) -> (f32, f32) {
        match self {
            MuscleGroup::Finger => (-1.5, 1.5),
            _ => (-1.0, 1.0),
        }
    }

    /// Bit widths indexed by `Quality::index()`.
    pub fn widths(self) -> [u8; 4] {
        match self {
            MuscleGroup::Torso => [8, 10, 14, 18],
            MuscleGroup::Head => [7, 9, 11, 14],
            MuscleGroup::Face => [4, 6, 8, 10],
            MuscleGroup::Leg => [8, 10, 12, 16],
            MuscleGroup::Arm => [8, 10, 12, 16],
            MuscleGroup::Finger => [3, 5, 7, 9],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Muscle {
    pub name: &'static str,
    pub group: MuscleGroup,
}

impl Muscle {
    pub fn min(&self) -> f32 {
        self.group.range().0
    }

    pub fn max(&self) -> f32 {
        self.group.range().1
    }

    pub fn width(&self, quality: Quality) -> u8 {
        self.group.widths()[quality.index()]
    }
}

const fn m(name: &'static str, group: MuscleGroup) -> Muscle {
    Muscle { name, group }
}

use self::MuscleGroup::{Arm, Face, Finger, Head, Leg, Torso};

/// Slot order is part of the wire format.
pub static MUSCLES: [Muscle; MUSCLE_COUNT] = [
    m("Spine Front-Back", Torso),
    m("Spine Left-Right", Torso),
    m("Spine Twist Left-Right", Torso),
    m("Chest Front-Back", Torso),
    m("Chest Left-Right", Torso),
    m("Chest Twist Left-Right", Torso),
    m("UpperChest Front-Back", Torso),
    m("UpperChest Left-Right", Torso),
    m("UpperChest Twist Left-Right", Torso),
    m("Neck Nod Down-Up", Head),
    m("Neck Tilt Left-Right", Head),
    m("Neck Turn Left-Right", Head),
    m("Head Nod Down-Up", Head),
    m("Head Tilt Left-Right", Head),
    m("Head Turn Left-Right", Head),
    m("Left Eye Down-Up", Face),
    m("Left Eye In-Out", Face),
    m("Right Eye Down-Up", Face),
    m("Right Eye In-Out", Face),
    m("Jaw Close", Face),
    m("Jaw Left-Right", Face),
    m("Left Upper Leg Front-Back", Leg),
    m("Left Upper Leg In-Out", Leg),
    m("Left Upper Leg Twist In-Out", Leg),
    m("Left Lower Leg Stretch", Leg),
    m("Left Lower Leg Twist In-Out", Leg),
    m("Left Foot Up-Down", Leg),
    m("Left Foot Twist In-Out", Leg),
    m("Left Toes Up-Down", Leg),
    m("Right Upper Leg Front-Back", Leg),
    m("Right Upper Leg In-Out", Leg),
    m("Right Upper Leg Twist In-Out", Leg),
    m("Right Lower Leg Stretch", Leg),
    m("Right Lower Leg Twist In-Out", Leg),
    m("Right Foot Up-Down", Leg),
    m("Right Foot Twist In-Out", Leg),
    m("Right Toes Up-Down", Leg),
    m("Left Shoulder Down-Up", Arm),
    m("Left Shoulder Front-Back", Arm),
    m("Left Arm Down-Up", Arm),
    m("Left Arm Front-Back", Arm),
    m("Left Arm Twist In-Out", Arm),
    m("Left Forearm Stretch", Arm),
    m("Left Forearm Twist In-Out", Arm),
    m("Left Hand Down-Up", Arm),
    m("Left Hand In-Out", Arm),
    m("Right Shoulder Down-Up", Arm),
    m("Right Shoulder Front-Back", Arm),
    m("Right Arm Down-Up", Arm),
    m("Right Arm Front-Back", Arm),
    m("Right Arm Twist In-Out", Arm),
    m("Right Forearm Stretch", Arm),
    m("Right Forearm Twist In-Out", Arm),
    m("Right Hand Down-Up", Arm),
    m("Right Hand In-Out", Arm),
    m("LeftHand.Thumb.1 Stretched", Finger),
    m("LeftHand.Thumb.Spread", Finger),
    m("LeftHand.Thumb.2 Stretched", Finger),
    m("LeftHand.Thumb.3 Stretched", Finger),
    m("LeftHand.Index.1 Stretched", Finger),
    m("LeftHand.Index.Spread", Finger),
    m("LeftHand.Index.2 Stretched", Finger),
    m("LeftHand.Index.3 Stretched", Finger),
    m("LeftHand.Middle.1 Stretched", Finger),
    m("LeftHand.Middle.Spread", Finger),
    m("LeftHand.Middle.2 Stretched", Finger),
    m("LeftHand.Middle.3 Stretched", Finger),
    m("LeftHand.Ring.1 Stretched", Finger),
    m("LeftHand.Ring.Spread", Finger),
    m("LeftHand.Ring.2 Stretched", Finger),
    m("LeftHand.Ring.3 Stretched", Finger),
    m("LeftHand.Little.1 Stretched", Finger),
    m("LeftHand.Little.Spread", Finger),
    m("LeftHand.Little.2 Stretched", Finger),
    m("LeftHand.Little.3 Stretched", Finger),
    m("RightHand.Thumb.1 Stretched", Finger),
    m("RightHand.Thumb.Spread", Finger),
    m("RightHand.Thumb.2 Stretched", Finger),
    m("RightHand.Thumb.3 Stretched", Finger),
    m("RightHand.Index.1 Stretched", Finger),
    m("RightHand.Index.Spread", Finger),
    m("RightHand.Index.2 Stretched", Finger),
    m("RightHand.Index.3 Stretched", Finger),
    m("RightHand.Middle.1 Stretched", Finger),
    m("RightHand.Middle.Spread", Finger),
    m("RightHand.Middle.2 Stretched", Finger),
    m("RightHand.Middle.3 Stretched", Finger),
    m("RightHand.Ring.1 Stretched", Finger),
    m("RightHand.Ring.Spread", Finger),
    m("RightHand.Ring.2 Stretched", Finger),
    m("RightHand.Ring.3 Stretched", Finger),
    m("RightHand.Little.1 Stretched", Finger),
    m("RightHand.Little.Spread", Finger),
    m("RightHand.Little.2 Stretched", Finger),
    m("RightHand.Little.3 Stretched", Finger),
];

/// Precomputed per-quality widths and bit offsets for the channel block.
#[derive(Debug, Clone)]
pub struct QualityLayout {
    pub quality: Quality,
    pub widths: [u8; MUSCLE_COUNT],
    pub offsets: Vec<usize>,
    pub total_bits: usize,
    pub muscle_bytes: usize,
}

impl QualityLayout {
    fn build(quality: Quality) -> Self {
        let mut widths = [0u8; MUSCLE_COUNT];
        for (slot, muscle) in MUSCLES.iter().enumerate() {
            widths[slot] = muscle.width(quality);
        }
        let total_bits = total_bits(&widths);

        Self {
            quality,
            widths,
            offsets: bit_offsets_for(&widths),
            total_bits,
            muscle_bytes: bytes_for_bits(total_bits),
        }
    }
}

fn layouts() -> &'static [QualityLayout; 4] {
    static LAYOUTS: OnceLock<[QualityLayout; 4]> = OnceLock::new();
    LAYOUTS.get_or_init(|| Quality::ALL.map(QualityLayout::build))
}

pub fn muscle_bytes(quality: Quality) -> usize {
    quality.layout().muscle_bytes
}

pub fn find_muscle(name: &str) -> Option<usize> {
    MUSCLES.iter().position(|m| m.name == name)
}
