pub mod constants;
mod error;
mod mine;

use constants::{GENESIS_PREDECESSOR, HASH_SIZE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{Error, Result};
pub use mine::{available_workers, default_workers, MiningEngine, MiningMode, MiningReport};

pub type Hash = [u8; HASH_SIZE];

/// An already-validated transfer. Field order is part of the block hash input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    sender: String,
    receiver: String,
    amount: u64,
}

impl Transaction {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, amount: u64) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    index: u64,
    predecessor_hash: String,
    /// Milliseconds since the Unix epoch, fixed at construction.
    created_at: u64,
    difficulty: u32,
    nonce: u64,
    transactions: Vec<Transaction>,
    /// Empty until the block is sealed.
    content_hash: String,
    /// Hash evaluations spent sealing this block.
    attempts: u64,
}

impl Block {
    /// Build an unsealed block stamped with the current wall-clock time.
    ///
    /// `difficulty` is not range-checked here; sealing rejects anything above
    /// `MAX_DIFFICULTY` with `Error::InvalidConfiguration` and leaves the block
    /// unsealed. `Chain::append` replaces it with the chain's checked value.
    pub fn new(
        index: u64,
        predecessor_hash: impl Into<String>,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self::with_timestamp(index, predecessor_hash, difficulty, transactions, now_millis())
    }

    /// Build an unsealed block with an injected creation time. Difficulty is
    /// checked at sealing, as for `Block::new`.
    pub fn with_timestamp(
        index: u64,
        predecessor_hash: impl Into<String>,
        difficulty: u32,
        transactions: Vec<Transaction>,
        created_at: u64,
    ) -> Self {
        Self {
            index,
            predecessor_hash: predecessor_hash.into(),
            created_at,
            difficulty,
            nonce: 0,
            transactions,
            content_hash: String::new(),
            attempts: 0,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn predecessor_hash(&self) -> &str {
        &self.predecessor_hash
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Hex content hash, `None` while the block is unsealed.
    pub fn content_hash(&self) -> Option<&str> {
        if self.content_hash.is_empty() {
            None
        } else {
            Some(&self.content_hash)
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn is_sealed(&self) -> bool {
        !self.content_hash.is_empty()
    }

    /// Hash of the current field values, hex encoded. Never reads the clock.
    pub fn compute_hash(&self) -> String {
        hex::encode(self.hash_template().digest(self.nonce))
    }

    /// A sealed block verifies when its stored hash matches a recomputation
    /// and carries at least `difficulty` leading zero hex digits.
    pub fn verify(&self) -> bool {
        self.is_sealed()
            && self.compute_hash() == self.content_hash
            && pow::meets_difficulty(&self.content_hash, self.difficulty)
    }

    pub(crate) fn hash_template(&self) -> HashTemplate {
        HashTemplate::new(self)
    }

    pub(crate) fn link(&mut self, index: u64, predecessor_hash: &str, difficulty: u32) {
        self.index = index;
        self.predecessor_hash = predecessor_hash.to_string();
        self.difficulty = difficulty;
    }

    pub(crate) fn seal(&mut self, nonce: u64, content_hash: String, attempts: u64) {
        self.nonce = nonce;
        self.content_hash = content_hash;
        self.attempts = attempts;
    }
}

/// Hash input split around the nonce: index, predecessor and timestamp are
/// absorbed once into `prefix`, the transaction list is rendered once into
/// `suffix`. Each digest clones the prefix state and feeds the nonce digits.
#[derive(Clone)]
pub(crate) struct HashTemplate {
    prefix: Sha256,
    suffix: Vec<u8>,
}

impl HashTemplate {
    fn new(block: &Block) -> Self {
        let mut buf = [0u8; 20];
        let mut prefix = Sha256::new();
        prefix.update(decimal(block.index, &mut buf));
        prefix.update(block.predecessor_hash.as_bytes());
        prefix.update(decimal(block.created_at, &mut buf));

        let mut suffix = Vec::new();
        for tx in &block.transactions {
            suffix.extend_from_slice(tx.sender.as_bytes());
            suffix.extend_from_slice(tx.receiver.as_bytes());
            suffix.extend_from_slice(decimal(tx.amount, &mut buf));
        }
        Self { prefix, suffix }
    }

    pub(crate) fn digest(&self, nonce: u64) -> Hash {
        let mut buf = [0u8; 20];
        let mut hasher = self.prefix.clone();
        hasher.update(decimal(nonce, &mut buf));
        hasher.update(&self.suffix);
        let digest = hasher.finalize();
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&digest[..]);
        out
    }
}

/// Render `n` in base 10 into the tail of `buf` without allocating.
fn decimal(mut n: u64, buf: &mut [u8; 20]) -> &[u8] {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[pos..]
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub mod pow {
    use super::Hash;
    use crate::constants::{BITS_PER_HEX_DIGIT, BYTE, MAX_DIFFICULTY};
    use crate::{Error, Result};

    pub fn count_leading_zero_bits(hash: &Hash) -> u32 {
        let mut total = 0u32;
        for b in hash {
            if *b == 0 {
                total += BYTE as u32;
            } else {
                total += b.leading_zeros();
                break;
            }
        }
        total
    }

    /// Leading zero digits of the hash once rendered as hex.
    pub fn leading_zero_digits(hash: &Hash) -> u32 {
        count_leading_zero_bits(hash) / BITS_PER_HEX_DIGIT
    }

    pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
        let want = difficulty as usize;
        hash_hex.len() >= want && hash_hex.bytes().take(want).all(|b| b == b'0')
    }

    pub fn check_difficulty(difficulty: u32) -> Result<()> {
        if difficulty > MAX_DIFFICULTY {
            return Err(Error::invalid_difficulty(difficulty));
        }
        Ok(())
    }
}

pub mod chain {
    use super::*;
    use crate::pow::check_difficulty;
    use tracing::{debug, info, warn};

    /// Append-only sequence of sealed blocks rooted at an unmined genesis.
    #[derive(Clone, Debug)]
    pub struct Chain {
        difficulty: u32,
        engine: MiningEngine,
        blocks: Vec<Block>,
    }

    impl Chain {
        /// A chain sealed by a single-worker engine.
        pub fn new(difficulty: u32) -> Result<Self> {
            Self::with_engine(difficulty, MiningEngine::default())
        }

        pub fn with_engine(difficulty: u32, engine: MiningEngine) -> Result<Self> {
            check_difficulty(difficulty)?;
            Ok(Self {
                difficulty,
                engine,
                blocks: vec![genesis_block(difficulty)],
            })
        }

        /// Rebuild an independent chain from blocks copied out of another one,
        /// e.g. a prefix of `Chain::blocks`. The blocks are re-verified.
        pub fn from_blocks(
            difficulty: u32,
            engine: MiningEngine,
            blocks: Vec<Block>,
        ) -> Result<Self> {
            check_difficulty(difficulty)?;
            let chain = Self {
                difficulty,
                engine,
                blocks,
            };
            chain.validate()?;
            Ok(chain)
        }

        pub fn difficulty(&self) -> u32 {
            self.difficulty
        }

        pub fn engine(&self) -> &MiningEngine {
            &self.engine
        }

        pub fn blocks(&self) -> &[Block] {
            &self.blocks
        }

        /// Index of the tip; 0 when only genesis is present.
        pub fn height(&self) -> u64 {
            self.tip().index
        }

        pub fn tip(&self) -> &Block {
            // `blocks` always holds at least the genesis block.
            &self.blocks[self.blocks.len() - 1]
        }

        /// Link `block` to the tip, seal it at the chain's difficulty and push it.
        /// On error the chain is left untouched.
        pub fn append(&mut self, mut block: Block) -> Result<&Block> {
            let tip = self.tip();
            let index = tip.index + 1;
            block.link(index, &tip.content_hash, self.difficulty);

            info!(index, difficulty = self.difficulty, "mining block");
            let report = match self.engine.seal(&mut block) {
                Ok(report) => report,
                Err(err) => {
                    warn!(index, error = %err, "mining failed, chain unchanged");
                    return Err(err);
                }
            };
            debug!(
                index,
                nonce = report.nonce,
                attempts = report.attempts,
                hash = %report.hash,
                "block appended"
            );

            self.blocks.push(block);
            Ok(self.tip())
        }

        /// Re-check linkage, indices, the chain difficulty and every block hash
        /// from genesis to tip.
        pub fn validate(&self) -> Result<()> {
            let Some(genesis) = self.blocks.first() else {
                return Err(Error::InvalidChain {
                    index: 0,
                    reason: "no genesis block".into(),
                });
            };
            if genesis.index != 0 || genesis.predecessor_hash != GENESIS_PREDECESSOR {
                return Err(Error::InvalidChain {
                    index: genesis.index,
                    reason: "malformed genesis block".into(),
                });
            }
            if let Some(block) = self.blocks.iter().find(|b| b.difficulty != self.difficulty) {
                return Err(Error::InvalidChain {
                    index: block.index,
                    reason: format!(
                        "block difficulty {} differs from chain difficulty {}",
                        block.difficulty, self.difficulty
                    ),
                });
            }
            // Genesis is exempt from proof of work, not from hash integrity.
            if !genesis.is_sealed() || genesis.compute_hash() != genesis.content_hash {
                return Err(Error::InvalidChain {
                    index: 0,
                    reason: "genesis hash mismatch".into(),
                });
            }

            for pair in self.blocks.windows(2) {
                let (prev, block) = (&pair[0], &pair[1]);
                if block.index != prev.index + 1 {
                    return Err(Error::InvalidChain {
                        index: block.index,
                        reason: format!("expected index {}", prev.index + 1),
                    });
                }
                if block.predecessor_hash != prev.content_hash {
                    return Err(Error::InvalidChain {
                        index: block.index,
                        reason: "predecessor hash does not match previous block".into(),
                    });
                }
                if !block.verify() {
                    return Err(Error::InvalidChain {
                        index: block.index,
                        reason: "content hash or proof of work invalid".into(),
                    });
                }
            }
            Ok(())
        }
    }

    /// Genesis carries no transactions and is hashed directly with nonce 0.
    pub fn genesis_block(difficulty: u32) -> Block {
        let mut genesis = Block::new(0, GENESIS_PREDECESSOR, difficulty, vec![]);
        let hash = genesis.compute_hash();
        genesis.seal(0, hash, 0);
        genesis
    }
}
