//! Partitioning strategies for subscriber worker lanes

use crate::types::PartitionKey;
use std::sync::atomic::{AtomicU32, Ordering};

/// Partitioning strategy
pub trait PartitioningStrategy: Send + Sync {
    /// Compute partition number for given key
    fn partition(&self, key: &PartitionKey) -> u32;

    /// Total number of partitions
    fn num_partitions(&self) -> u32;
}

/// Hash-based partitioning: one key always lands on one lane
#[derive(Debug, Clone)]
pub struct HashPartitioning {
    num_partitions: u32,
}

impl HashPartitioning {
    /// Create new hash-based partitioning with given partition count
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
        }
    }
}

impl Default for HashPartitioning {
    fn default() -> Self {
        Self::new(8)
    }
}

impl PartitioningStrategy for HashPartitioning {
    fn partition(&self, key: &PartitionKey) -> u32 {
        key.partition_number(self.num_partitions)
    }

    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }
}

/// Round-robin partitioning, for messages without an ordering key
#[derive(Debug)]
pub struct RoundRobinPartitioning {
    num_partitions: u32,
    counter: AtomicU32,
}

impl RoundRobinPartitioning {
    /// Create new round-robin partitioning
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            counter: AtomicU32::new(0),
        }
    }
}

impl PartitioningStrategy for RoundRobinPartitioning {
    fn partition(&self, _key: &PartitionKey) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.num_partitions
    }

    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }
}

/// Lane assignment: keyed messages by hash, unkeyed ones spread round-robin
#[derive(Debug)]
pub struct LaneAssigner {
    keyed: HashPartitioning,
    unkeyed: RoundRobinPartitioning,
}

impl LaneAssigner {
    /// Assigner over `lanes` lanes
    pub fn new(lanes: u32) -> Self {
        Self {
            keyed: HashPartitioning::new(lanes),
            unkeyed: RoundRobinPartitioning::new(lanes),
        }
    }

    /// Lane for a message key
    pub fn lane(&self, key: &PartitionKey) -> usize {
        let lane = match key {
            PartitionKey::Unkeyed => self.unkeyed.partition(key),
            PartitionKey::Institution(_) => self.keyed.partition(key),
        };
        lane as usize
    }

    /// Number of lanes
    pub fn lanes(&self) -> usize {
        self.keyed.num_partitions() as usize
    }
}
