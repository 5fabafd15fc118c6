//! Property-Based Tests for Cached Trees
//!
//! # Test Properties
//!
//! 1. **Address Decomposition**: per-level child indices rebuild the address
//! 2. **Block Containment**: every level's block contains the address
//! 3. **Model Equivalence**: random writes read back like a flat byte vector
//! 4. **Sync Persistence**: after `sync` the storage holds the model bytes
//! 5. **Pipelined Writes**: unawaited overlapping writes under eviction
//!    pressure still land in issue order

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use super::{LevelTable, Tree};
use crate::completion::IoState;
use crate::config::ControllerConfig;
use crate::scheduler::Controller;
use crate::storage::MemoryStorage;

const POLL: Duration = Duration::from_millis(1);

// =============================================================================
// Property Strategies
// =============================================================================

/// Width vectors summing to 64 with 2..=6 levels
fn levels_strategy() -> impl Strategy<Value = LevelTable> {
    prop::collection::vec(1u32..=12, 1..=5).prop_map(|mut tail| {
        let used: u32 = tail.iter().sum();
        let mut widths = vec![64 - used];
        widths.append(&mut tail);
        LevelTable::new(widths).unwrap()
    })
}

/// Writes inside the first 4 KiB of a "52,4,8" tree
fn writes_strategy() -> impl Strategy<Value = Vec<(u64, Vec<u8>)>> {
    prop::collection::vec(
        (0u64..4096, prop::collection::vec(any::<u8>(), 1..600)),
        1..8,
    )
}

/// Overlapping writes spread over four L1 blocks
fn pipelined_writes_strategy() -> impl Strategy<Value = Vec<(u64, Vec<u8>)>> {
    prop::collection::vec(
        (0u64..16384, prop::collection::vec(any::<u8>(), 1..700)),
        60,
    )
}

fn small_tree(upper: u64) -> (Controller, Arc<MemoryStorage>, Tree) {
    watermarked_tree(upper / 2, upper)
}

fn watermarked_tree(lower: u64, upper: u64) -> (Controller, Arc<MemoryStorage>, Tree) {
    let config = ControllerConfig {
        idle_rounds_before_decay: u32::MAX,
        ..ControllerConfig::new(lower, upper, 2)
    };
    let ctrl = Controller::with_config(config).unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let tree = Tree::new(storage.clone(), "52,4,8".parse().unwrap());
    (ctrl, storage, tree)
}

fn apply(model: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let end = offset as usize + data.len();
    if model.len() < end {
        model.resize(end, 0);
    }
    model[offset as usize..end].copy_from_slice(data);
}

// =============================================================================
// Level Table Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Child indices across all levels reassemble the address
    #[test]
    fn prop_child_indices_rebuild_address(levels in levels_strategy(), addr in any::<u64>()) {
        let mut rebuilt = 0u64;
        for level in 0..levels.depth() {
            let index = levels.child_index(level, addr);
            prop_assert!(u128::from(index) < (1u128 << levels.width(level)));
            rebuilt |= index << levels.bits_below(level);
        }
        prop_assert_eq!(rebuilt, addr);
    }

    /// Each level's block base is aligned and contains the address
    #[test]
    fn prop_block_contains_address(levels in levels_strategy(), addr in any::<u64>()) {
        for level in 1..levels.depth() {
            let len = levels.block_len(level).unwrap();
            let base = levels.block_base(level, addr);
            prop_assert_eq!(base % len, 0);
            prop_assert!(base <= addr && addr - base < len);
            if let Some(parent) = levels.block_len(level - 1) {
                prop_assert_eq!(parent / len, 1u64 << levels.width(level - 1));
            }
        }
    }

    /// The textual form parses back to the same table
    #[test]
    fn prop_display_parses_back(levels in levels_strategy()) {
        let text = levels.to_string();
        prop_assert_eq!(LevelTable::parse(&text).unwrap(), levels);
    }
}

// =============================================================================
// Tree Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Reads after a series of writes match a flat byte-vector model
    #[test]
    fn prop_reads_match_model(writes in writes_strategy(), upper in prop::sample::select(vec![300u64, 1 << 20])) {
        let (ctrl, _storage, tree) = small_tree(upper);
        let mut model = Vec::new();
        for (offset, data) in &writes {
            let handle = tree.write(&ctrl, *offset, data.clone());
            prop_assert_eq!(handle.wait(POLL), IoState::Done);
            apply(&mut model, *offset, data);
        }
        prop_assert_eq!(tree.size(), model.len() as u64);

        let read = tree.read(&ctrl, 0, model.len());
        prop_assert_eq!(read.wait(POLL), IoState::Done);
        let read_bytes = read.into_bytes().unwrap();
        prop_assert_eq!(read_bytes.as_ref(), model.as_slice());
    }

    /// After sync the storage engine holds exactly the model bytes
    #[test]
    fn prop_sync_persists_model(writes in writes_strategy()) {
        let (ctrl, storage, tree) = small_tree(1 << 20);
        let mut model = Vec::new();
        for (offset, data) in &writes {
            prop_assert_eq!(tree.write(&ctrl, *offset, data.clone()).wait(POLL), IoState::Done);
            apply(&mut model, *offset, data);
        }
        prop_assert_eq!(tree.sync(&ctrl).wait(POLL), IoState::Done);
        prop_assert_eq!(storage.contents(), model);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    /// Writes issued back to back without waiting apply in issue order
    #[test]
    fn prop_pipelined_writes_match_model(writes in pipelined_writes_strategy()) {
        let (ctrl, storage, tree) = watermarked_tree(8 * 1024, 32 * 1024);
        let mut model = Vec::new();
        let handles: Vec<_> = writes
            .iter()
            .map(|(offset, data)| {
                apply(&mut model, *offset, data);
                tree.write(&ctrl, *offset, data.clone())
            })
            .collect();
        for handle in &handles {
            prop_assert_eq!(handle.wait(POLL), IoState::Done);
        }
        prop_assert!(!tree.failed());
        prop_assert_eq!(tree.size(), model.len() as u64);

        let read = tree.read(&ctrl, 0, model.len());
        prop_assert_eq!(read.wait(POLL), IoState::Done);
        let read_bytes = read.into_bytes().unwrap();
        prop_assert_eq!(read_bytes.as_ref(), model.as_slice());

        prop_assert_eq!(tree.sync(&ctrl).wait(POLL), IoState::Done);
        prop_assert_eq!(storage.contents(), model);
    }
}
