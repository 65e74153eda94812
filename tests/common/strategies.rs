//! Proptest strategies for store workloads.

use proptest::prelude::*;

/// Number of appends and, for each, whether it gets acked.
pub fn append_ack_plan() -> impl Strategy<Value = (usize, Vec<bool>)> {
    (1usize..40).prop_flat_map(|n| (Just(n), prop::collection::vec(any::<bool>(), n)))
}

/// Concurrent writers and appends per writer.
pub fn concurrent_writers() -> impl Strategy<Value = (usize, usize)> {
    (1usize..6, 1usize..25)
}

/// TTLs for a sequence of appends; zero means already expired.
pub fn ttl_plan() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(prop_oneof![Just(0u64), 1u64..3_600], 1..30)
}
