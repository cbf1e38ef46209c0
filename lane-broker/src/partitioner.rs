//! Kafka-compatible partition selection.
//!
//! Keyed records are routed with murmur2 and `KAFKA_SEED`, matching Apache
//! Kafka's default partitioner, so a key lands on the same partition index in
//! the in-memory backend as it would on a real cluster. Unkeyed records are
//! spread round-robin using a caller-owned counter.

use murmur2::{murmur2, KAFKA_SEED};

/// Compute the target partition for a record.
///
/// # Arguments
/// * `key` - Optional record key (if Some, used for hash-based routing)
/// * `partition_count` - Number of partitions for the topic (must be > 0)
/// * `round_robin` - Sequence number used when the record has no key
pub fn compute_partition(key: Option<&[u8]>, partition_count: i32, round_robin: u64) -> i32 {
    debug_assert!(partition_count > 0, "partition_count must be positive");

    match key {
        // Kafka's Utils.toPositive(Utils.murmur2(key)) % numPartitions
        Some(k) => ((murmur2(k, KAFKA_SEED) & 0x7fff_ffff) as i32) % partition_count,
        None => (round_robin % partition_count as u64) as i32,
    }
}
