//! Field bitset for change notifications and partial edits.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};

/// Bitset over the entry attributes a mutation touched.
///
/// `DURATION` and `PRECEDING_START` are derived attributes; they appear in
/// notification masks but are never written by edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldMask(u8);

impl FieldMask {
    pub const NONE: FieldMask = FieldMask(0);
    pub const START_TIME: FieldMask = FieldMask(1 << 0);
    pub const CATEGORY: FieldMask = FieldMask(1 << 1);
    pub const COMMENT: FieldMask = FieldMask(1 << 2);
    pub const DURATION: FieldMask = FieldMask(1 << 3);
    pub const PRECEDING_START: FieldMask = FieldMask(1 << 4);

    /// The three caller-writable fields, used by sync updates.
    pub const ALL_FIELDS: FieldMask =
        FieldMask(Self::START_TIME.0 | Self::CATEGORY.0 | Self::COMMENT.0);

    /// Whether every bit of `other` is set in `self`.
    pub fn contains(self, other: FieldMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for FieldMask {
    type Output = FieldMask;

    fn bitor(self, rhs: FieldMask) -> FieldMask {
        FieldMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: FieldMask) {
        self.0 |= rhs.0;
    }
}

impl Display for FieldMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::START_TIME, "start"),
            (Self::CATEGORY, "category"),
            (Self::COMMENT, "comment"),
            (Self::DURATION, "duration"),
            (Self::PRECEDING_START, "preceding_start"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        write!(f, "{}", names.join("|"))
    }
}
