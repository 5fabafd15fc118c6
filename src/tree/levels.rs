//! Level table
//!
//! A tree is described by the bit-width of each level, root first. The
//! widths partition the 64-bit address: the root consumes the top
//! `width[0]` bits, the leaf level the lowest `width[depth-1]` bits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default layout: 4 KiB leaves under five internal levels
pub const DEFAULT_LEVELS: [u32; 6] = [40, 3, 2, 3, 4, 12];

/// Per-level bit-widths of a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct LevelTable {
    widths: Vec<u32>,
    below: Vec<u32>,
}

impl LevelTable {
    /// Build from widths. Each must be in `1..=64` and together sum to 64.
    pub fn new(widths: Vec<u32>) -> Result<Self> {
        if widths.is_empty() {
            return Err(Error::InvalidLevels("at least one level required".into()));
        }
        if let Some(bad) = widths.iter().find(|w| **w == 0 || **w > 64) {
            return Err(Error::InvalidLevels(format!(
                "level width {bad} outside 1..=64"
            )));
        }
        let total: u32 = widths.iter().sum();
        if total != 64 {
            return Err(Error::InvalidLevels(format!(
                "level widths sum to {total}, expected 64"
            )));
        }

        let mut below = vec![0u32; widths.len()];
        for level in (0..widths.len() - 1).rev() {
            below[level] = below[level + 1] + widths[level + 1];
        }
        Ok(Self { widths, below })
    }

    /// Parse a comma-separated list such as `"32,2,9,9,12"`
    pub fn parse(text: &str) -> Result<Self> {
        let widths = text
            .split(',')
            .map(|part| {
                part.trim().parse::<u32>().map_err(|e| {
                    Error::InvalidLevels(format!("bad level width {:?}: {e}", part.trim()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(widths)
    }

    /// Number of levels
    pub fn depth(&self) -> usize {
        self.widths.len()
    }

    pub fn widths(&self) -> &[u32] {
        &self.widths
    }

    pub fn width(&self, level: usize) -> u32 {
        self.widths[level]
    }

    /// Sum of the widths of all deeper levels
    pub fn bits_below(&self, level: usize) -> u32 {
        self.below[level]
    }

    pub fn is_leaf(&self, level: usize) -> bool {
        level + 1 == self.widths.len()
    }

    /// Block size of a node at `level`; `None` for a 2^64 block
    pub fn block_len(&self, level: usize) -> Option<u64> {
        1u64.checked_shl(self.widths[level] + self.below[level])
    }

    /// Block size of a child of a node at `level`
    pub fn child_len(&self, level: usize) -> u64 {
        1u64 << self.below[level]
    }

    /// Index of the child of a `level` node containing `addr`
    pub fn child_index(&self, level: usize, addr: u64) -> u64 {
        let mask = match 1u64.checked_shl(self.widths[level]) {
            Some(fanout) => fanout - 1,
            None => u64::MAX,
        };
        (addr >> self.below[level]) & mask
    }

    /// Base address of the block at `level` containing `addr`
    pub fn block_base(&self, level: usize, addr: u64) -> u64 {
        match self.block_len(level) {
            Some(len) => addr & !(len - 1),
            None => 0,
        }
    }
}

impl Default for LevelTable {
    fn default() -> Self {
        let widths = DEFAULT_LEVELS.to_vec();
        let mut below = vec![0u32; widths.len()];
        for level in (0..widths.len() - 1).rev() {
            below[level] = below[level + 1] + widths[level + 1];
        }
        Self { widths, below }
    }
}

impl TryFrom<Vec<u32>> for LevelTable {
    type Error = Error;

    fn try_from(widths: Vec<u32>) -> Result<Self> {
        Self::new(widths)
    }
}

impl From<LevelTable> for Vec<u32> {
    fn from(table: LevelTable) -> Self {
        table.widths
    }
}

impl FromStr for LevelTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LevelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, width) in self.widths.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{width}")?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_table() {
        let table = LevelTable::default();
        assert_eq!(table, LevelTable::new(DEFAULT_LEVELS.to_vec()).unwrap());
        assert_eq!(table.depth(), 6);
        assert_eq!(table.bits_below(0), 24);
        assert_eq!(table.bits_below(5), 0);
        assert_eq!(table.block_len(5), Some(4096));
        assert_eq!(table.block_len(4), Some(1 << 16));
        assert_eq!(table.block_len(0), None);
        assert!(table.is_leaf(5));
        assert!(!table.is_leaf(4));
    }

    #[test]
    fn test_parse() {
        let table = LevelTable::parse("32, 2,9,9,12").unwrap();
        assert_eq!(table.widths(), &[32, 2, 9, 9, 12]);
        assert_eq!(table.to_string(), "32,2,9,9,12");
        assert_eq!(table.bits_below(1), 30);
        assert_eq!(table.child_len(1), 1 << 30);

        assert_matches!(LevelTable::parse("32,x"), Err(Error::InvalidLevels(_)));
        assert_matches!(LevelTable::parse("32,31"), Err(Error::InvalidLevels(_)));
        assert_matches!(LevelTable::parse("0,64"), Err(Error::InvalidLevels(_)));
        assert_matches!(LevelTable::new(vec![]), Err(Error::InvalidLevels(_)));
    }

    #[test]
    fn test_single_level() {
        let table = LevelTable::new(vec![64]).unwrap();
        assert!(table.is_leaf(0));
        assert_eq!(table.block_len(0), None);
        assert_eq!(table.block_base(0, 12345), 0);
    }

    #[test]
    fn test_child_index() {
        let table = LevelTable::parse("32,2,9,9,12").unwrap();
        // level 3 (width 9) children are 4 KiB leaves
        assert_eq!(table.child_index(3, 0), 0);
        assert_eq!(table.child_index(3, 4095), 0);
        assert_eq!(table.child_index(3, 4096), 1);
        assert_eq!(table.child_index(3, 9999), 2);
        assert_eq!(table.child_index(3, (1 << 21) + 4096), 1);
        assert_eq!(table.child_index(0, u64::MAX), (1 << 32) - 1);
        assert_eq!(table.block_base(4, 9999), 8192);
    }

    #[test]
    fn test_serde_validates() {
        let table: LevelTable = serde_yaml::from_str("[32, 2, 9, 9, 12]").unwrap();
        assert_eq!(table.depth(), 5);
        assert!(serde_yaml::from_str::<LevelTable>("[32, 2]").is_err());
    }
}
