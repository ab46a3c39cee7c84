//! Stable local inode identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Synthetic, locally allocated inode number
///
/// Unlike remote handles, an id never changes for the life of the inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeID(u64);

impl InodeID {
    /// First id handed out; 1 is reserved for the FUSE root
    pub const FIRST: InodeID = InodeID(2);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for InodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(InodeID::new(0x2a).to_string(), "000000000000002a");
    }
}
