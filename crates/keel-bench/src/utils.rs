//! Benchmark utilities and helpers.

use bytes::Bytes;
use keel_common::types::{ResourceId, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generates `count` rows of one table with sequential keys.
pub fn generate_rows(table_id: u64, count: usize) -> Vec<ResourceId> {
    (0..count)
        .map(|i| ResourceId::row(table_id, format!("key_{:08}", i)))
        .collect()
}

/// Generates `count` random values of `size` bytes.
pub fn generate_values(count: usize, size: usize) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| {
            let bytes: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
            Bytes::from(bytes)
        })
        .collect()
}

/// Generates a deterministic sequence of indexes below `bound`.
pub fn generate_indexes(count: usize, bound: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count).map(|_| rng.gen_range(0..bound)).collect()
}
