//! Property-based test generators using proptest.
//!
//! Provides strategies for generating data file names, deletions and
//! identifiers that keep the invariants the engine relies on.

use crate::fixtures::test_key;
use proptest::prelude::*;
use tsmerge_core::{CompactionCheckpoint, Deletion, FileIdentifier, TsFileName};

/// Strategy for structured data file names.
pub fn ts_file_name_strategy() -> impl Strategy<Value = TsFileName> {
    (0u64..10_000, 0u64..10_000, 0u32..8, 0u32..4).prop_map(
        |(timestamp, version, inner_level, cross_level)| TsFileName {
            timestamp,
            version,
            inner_level,
            cross_level,
        },
    )
}

/// Strategy for identifiers in the test registry.
pub fn file_identifier_strategy() -> impl Strategy<Value = FileIdentifier> {
    ts_file_name_strategy().prop_map(|n| FileIdentifier::new(&test_key(), n.to_string()))
}

/// Strategy for series paths, which may contain commas.
pub fn series_path_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("root\\.sg\\.[a-z][a-z0-9,]{0,15}\\.s[0-9]{1,2}")
        .expect("Invalid regex")
}

/// Strategy for deletions with a non-inverted time range.
pub fn deletion_strategy() -> impl Strategy<Value = Deletion> {
    (series_path_strategy(), any::<u64>(), any::<i32>(), 0i64..1_000_000).prop_map(
        |(path, offset, start, span)| Deletion::new(path, offset, i64::from(start), i64::from(start) + span),
    )
}

/// Strategy for a ledger's worth of deletions.
pub fn ledger_strategy(max: usize) -> impl Strategy<Value = Vec<Deletion>> {
    prop::collection::vec(deletion_strategy(), 0..=max)
}

/// Strategy for adjacent level-0 source names, oldest first.
pub fn source_run_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    (2..=max.max(2), 1u64..1_000).prop_map(|(len, first)| {
        (0..len as u64)
            .map(|i| format!("{}-{}-0-0.tsfile", first + i, first + i))
            .collect()
    })
}

/// Strategy for a checkpoint of a task over `sources` files.
pub fn checkpoint_strategy(sources: usize) -> impl Strategy<Value = CompactionCheckpoint> {
    prop::sample::select(CompactionCheckpoint::sequence(sources))
}
