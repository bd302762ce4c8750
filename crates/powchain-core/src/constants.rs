pub const BYTE: usize = 8;
pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
pub const BITS_PER_HEX_DIGIT: u32 = 4;

/// Highest difficulty that a SHA-256 hex digest can satisfy.
pub const MAX_DIFFICULTY: u32 = HASH_HEX_SIZE as u32;

/// Predecessor hash recorded on the genesis block.
pub const GENESIS_PREDECESSOR: &str = "0";

/// Parallel sealing only pays for its coordination above this difficulty.
pub const PARALLEL_DIFFICULTY_THRESHOLD: u32 = 5;
pub const MAX_WORKERS: usize = 4;

/// Local attempts between two polls of the shared stop flag.
pub const STOP_CHECK_INTERVAL: u64 = 1000;

/// Sentinel for "no nonce claimed yet"; the searchable space is `0..NO_NONCE`.
pub const NO_NONCE: u64 = u64::MAX;
