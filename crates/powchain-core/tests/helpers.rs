#![allow(dead_code)]

use powchain_core::{Block, Transaction};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_transactions(rng: &mut StdRng, count: usize) -> Vec<Transaction> {
    (0..count)
        .map(|_| {
            Transaction::new(
                format!("User_{}", rng.gen_range(1..=100)),
                format!("User_{}", rng.gen_range(1..=100)),
                rng.gen_range(1..10_000),
            )
        })
        .collect()
}

/// An unsealed block; the chain fills in index, predecessor and difficulty.
pub fn pending_block(txs: Vec<Transaction>) -> Block {
    Block::new(0, "", 0, txs)
}

pub fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(42)
}
