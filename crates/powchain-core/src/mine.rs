use crate::constants::{MAX_WORKERS, NO_NONCE, PARALLEL_DIFFICULTY_THRESHOLD, STOP_CHECK_INTERVAL};
use crate::{pow, Block, Error, HashTemplate, Result};
use rayon::ThreadPoolBuilder;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use tracing::{debug, info};

/// How a block gets sealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MiningMode {
    /// Linear scan of nonces 0, 1, 2, ... on the calling thread.
    Single,
    /// `workers` threads, worker `k` scanning nonces `k, k + workers, ...`.
    Parallel { workers: usize },
}

/// Outcome of a successful seal. `attempts` counts every hash evaluation,
/// across all workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiningReport {
    pub nonce: u64,
    pub hash: String,
    pub attempts: u64,
    pub mode: MiningMode,
}

#[derive(Clone, Debug)]
pub struct MiningEngine {
    parallel: bool,
    workers: Option<usize>,
    nonce_limit: u64,
}

impl Default for MiningEngine {
    fn default() -> Self {
        Self::new(false)
    }
}

impl MiningEngine {
    pub fn new(parallel: bool) -> Self {
        Self {
            parallel,
            workers: None,
            nonce_limit: NO_NONCE,
        }
    }

    /// Pin the parallel worker count instead of deriving it from the host.
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::InvalidConfiguration(
                "worker count must be at least 1".into(),
            ));
        }
        self.workers = Some(workers);
        Ok(self)
    }

    /// Shrink the searchable nonce space to `0..limit`.
    #[cfg(test)]
    pub(crate) fn with_nonce_limit(mut self, limit: u64) -> Self {
        self.nonce_limit = limit.min(NO_NONCE);
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Parallel sealing is used only when enabled and the difficulty is above
    /// `PARALLEL_DIFFICULTY_THRESHOLD`.
    pub fn mode_for(&self, difficulty: u32) -> MiningMode {
        if self.parallel && difficulty > PARALLEL_DIFFICULTY_THRESHOLD {
            MiningMode::Parallel {
                workers: self.workers.unwrap_or_else(default_workers),
            }
        } else {
            MiningMode::Single
        }
    }

    /// Seal `block` at its own difficulty, picking the mode with `mode_for`.
    pub fn seal(&self, block: &mut Block) -> Result<MiningReport> {
        let mode = self.mode_for(block.difficulty());
        self.seal_with(block, mode)
    }

    /// Seal `block` in place using `mode`. The block is only written once the
    /// search has succeeded; on error it is left as it was.
    pub fn seal_with(&self, block: &mut Block, mode: MiningMode) -> Result<MiningReport> {
        let difficulty = block.difficulty();
        pow::check_difficulty(difficulty)?;
        debug!(index = block.index(), difficulty, ?mode, "sealing block");

        let template = block.hash_template();
        let (nonce, attempts) = if difficulty == 0 {
            (0, 0)
        } else {
            match mode {
                MiningMode::Single => search_single(&template, difficulty, self.nonce_limit)?,
                MiningMode::Parallel { workers } => {
                    search_parallel(&template, difficulty, workers, self.nonce_limit)?
                }
            }
        };

        let hash = hex::encode(template.digest(nonce));
        info!(
            "Mined block {} with nonce {} and hash {} after {} attempts",
            block.index(),
            nonce,
            hash,
            attempts
        );
        block.seal(nonce, hash.clone(), attempts);

        Ok(MiningReport {
            nonce,
            hash,
            attempts,
            mode,
        })
    }
}

/// Hardware threads reported by the host, at least 1.
pub fn available_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn default_workers() -> usize {
    available_workers().min(MAX_WORKERS)
}

fn search_single(template: &HashTemplate, difficulty: u32, limit: u64) -> Result<(u64, u64)> {
    let mut attempts = 0u64;
    for nonce in 0..limit {
        attempts += 1;
        if pow::leading_zero_digits(&template.digest(nonce)) >= difficulty {
            return Ok((nonce, attempts));
        }
    }
    Err(Error::SearchExhausted {
        difficulty,
        attempts,
    })
}

/// State shared by the workers of one parallel search.
struct SharedSearch {
    found_nonce: AtomicU64,
    stop: AtomicBool,
    total_attempts: AtomicU64,
}

impl SharedSearch {
    fn new() -> Self {
        Self {
            found_nonce: AtomicU64::new(NO_NONCE),
            stop: AtomicBool::new(false),
            total_attempts: AtomicU64::new(0),
        }
    }

    /// First writer wins.
    fn claim(&self, nonce: u64) -> bool {
        self.found_nonce
            .compare_exchange(NO_NONCE, nonce, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn search_parallel(
    template: &HashTemplate,
    difficulty: u32,
    workers: usize,
    limit: u64,
) -> Result<(u64, u64)> {
    if workers == 0 {
        return Err(Error::InvalidConfiguration(
            "worker count must be at least 1".into(),
        ));
    }
    let available = available_workers();
    if workers > available {
        return Err(Error::ResourceExhaustion {
            requested: workers,
            reason: format!("host reports {available} hardware threads"),
        });
    }

    // One pool per call; dropping it at the end of this function tears the threads down.
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("pow-worker-{i}"))
        .build()
        .map_err(|e| Error::ResourceExhaustion {
            requested: workers,
            reason: e.to_string(),
        })?;

    let shared = SharedSearch::new();
    // `broadcast` runs the closure once on every pool thread and returns after all of them do.
    pool.broadcast(|ctx| {
        run_worker(
            ctx.index() as u64,
            ctx.num_threads() as u64,
            template,
            difficulty,
            limit,
            &shared,
        )
    });

    let attempts = shared.total_attempts.load(Ordering::Acquire);
    match shared.found_nonce.load(Ordering::Acquire) {
        NO_NONCE => Err(Error::SearchExhausted {
            difficulty,
            attempts,
        }),
        nonce => Ok((nonce, attempts)),
    }
}

/// Scan the residue class `offset mod step` until a hit, exhaustion, or a
/// stop request. The stop flag is polled every `STOP_CHECK_INTERVAL` attempts,
/// so a losing worker may overrun the winner by up to one batch.
fn run_worker(
    offset: u64,
    step: u64,
    template: &HashTemplate,
    difficulty: u32,
    limit: u64,
    shared: &SharedSearch,
) {
    let mut nonce = offset;
    let mut local_attempts = 0u64;
    debug!(worker = offset, step, "worker started");

    while nonce < limit {
        if local_attempts % STOP_CHECK_INTERVAL == 0 && shared.stop.load(Ordering::Acquire) {
            break;
        }

        local_attempts += 1;
        if pow::leading_zero_digits(&template.digest(nonce)) >= difficulty {
            if shared.claim(nonce) {
                debug!(worker = offset, nonce, "worker claimed nonce");
            }
            shared.stop.store(true, Ordering::Release);
            break;
        }

        nonce = match nonce.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }

    shared
        .total_attempts
        .fetch_add(local_attempts, Ordering::AcqRel);
    debug!(worker = offset, local_attempts, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transaction;

    const FIXED_TS: u64 = 1_600_000_000_000;

    fn block(difficulty: u32) -> Block {
        Block::with_timestamp(
            1,
            "0",
            difficulty,
            vec![Transaction::new("A", "B", 10)],
            FIXED_TS,
        )
    }

    fn parallel_mode() -> MiningMode {
        MiningMode::Parallel {
            workers: default_workers(),
        }
    }

    #[test]
    fn difficulty_zero_seals_immediately() {
        for mode in [MiningMode::Single, parallel_mode()] {
            let mut b = block(0);
            let report = MiningEngine::default().seal_with(&mut b, mode).unwrap();
            assert_eq!(report.nonce, 0);
            assert_eq!(report.attempts, 0);
            assert_eq!(b.nonce(), 0);
            assert_eq!(b.content_hash(), Some(b.compute_hash().as_str()));
        }
    }

    #[test]
    fn single_worker_finds_known_nonce() {
        let mut b = block(2);
        let report = MiningEngine::default().seal(&mut b).unwrap();

        assert_eq!(report.mode, MiningMode::Single);
        assert_eq!(report.nonce, 322);
        assert_eq!(report.attempts, 323);
        assert_eq!(
            report.hash,
            "0097df062c54f19bc7679bffcf892526eb61d0632dfa2de14b6f84021958e219"
        );
        assert!(report.hash.starts_with("00"));
        assert_eq!(b.compute_hash(), report.hash);
        assert_eq!(b.content_hash(), Some(report.hash.as_str()));
        assert_eq!(b.attempts(), 323);
        assert!(b.verify());
    }

    #[test]
    fn single_worker_is_deterministic() {
        let mut first = block(3);
        let mut second = block(3);
        let engine = MiningEngine::default();
        let a = engine.seal(&mut first).unwrap();
        let b = engine.seal(&mut second).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.nonce, 2052);
    }

    #[test]
    fn parallel_always_finds_a_valid_nonce() {
        let engine = MiningEngine::new(true);
        for _ in 0..5 {
            let mut b = block(3);
            let report = engine.seal_with(&mut b, parallel_mode()).unwrap();
            assert!(pow::meets_difficulty(&report.hash, 3));
            assert_eq!(b.compute_hash(), report.hash);
            assert!(b.verify());
            assert!(report.attempts > 0);
            assert_eq!(b.attempts(), report.attempts);
        }
    }

    #[test]
    fn parallel_with_one_worker_matches_linear_scan() {
        let engine = MiningEngine::new(true);
        let mut single = block(2);
        let mut parallel = block(2);
        let s = engine.seal_with(&mut single, MiningMode::Single).unwrap();
        let p = engine
            .seal_with(&mut parallel, MiningMode::Parallel { workers: 1 })
            .unwrap();
        assert_eq!((s.nonce, s.attempts), (p.nonce, p.attempts));
        assert_eq!(s.hash, p.hash);
    }

    #[test]
    fn mode_selection_respects_flag_and_threshold() {
        let single = MiningEngine::new(false);
        assert_eq!(single.mode_for(10), MiningMode::Single);

        let parallel = MiningEngine::new(true).with_workers(3).unwrap();
        assert_eq!(
            parallel.mode_for(PARALLEL_DIFFICULTY_THRESHOLD),
            MiningMode::Single
        );
        assert_eq!(
            parallel.mode_for(PARALLEL_DIFFICULTY_THRESHOLD + 1),
            MiningMode::Parallel { workers: 3 }
        );
    }

    #[test]
    fn default_workers_is_capped() {
        assert!(default_workers() >= 1);
        assert!(default_workers() <= MAX_WORKERS);
        assert!(default_workers() <= available_workers());
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(
            MiningEngine::new(true).with_workers(0),
            Err(Error::InvalidConfiguration(_))
        ));
        let mut b = block(1);
        let err = MiningEngine::default()
            .seal_with(&mut b, MiningMode::Parallel { workers: 0 })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(!b.is_sealed());
    }

    #[test]
    fn too_many_workers_is_resource_exhaustion() {
        let requested = available_workers() + 1;
        let mut b = block(1);
        let err = MiningEngine::new(true)
            .seal_with(&mut b, MiningMode::Parallel { workers: requested })
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhaustion { requested: r, .. } if r == requested));
        assert!(!b.is_sealed());
        assert_eq!(b.nonce(), 0);
    }

    #[test]
    fn exhausted_space_is_reported() {
        let engine = MiningEngine::default().with_nonce_limit(50);
        for mode in [MiningMode::Single, parallel_mode()] {
            let mut b = block(8);
            let err = engine.seal_with(&mut b, mode).unwrap_err();
            match err {
                Error::SearchExhausted {
                    difficulty,
                    attempts,
                } => {
                    assert_eq!(difficulty, 8);
                    assert_eq!(attempts, 50);
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(!b.is_sealed());
        }
    }

    #[test]
    fn unreachable_difficulty_is_rejected() {
        let mut b = block(crate::constants::MAX_DIFFICULTY + 1);
        let err = MiningEngine::default().seal(&mut b).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn claim_is_first_writer_wins() {
        let shared = SharedSearch::new();
        assert!(shared.claim(7));
        assert!(!shared.claim(3));
        assert_eq!(shared.found_nonce.load(Ordering::Acquire), 7);
    }

    #[test]
    fn stopped_worker_flushes_without_searching() {
        let shared = SharedSearch::new();
        shared.stop.store(true, Ordering::Release);
        let b = block(4);
        run_worker(0, 2, &b.hash_template(), 4, NO_NONCE, &shared);
        assert_eq!(shared.total_attempts.load(Ordering::Acquire), 0);
        assert_eq!(shared.found_nonce.load(Ordering::Acquire), NO_NONCE);
    }
}
