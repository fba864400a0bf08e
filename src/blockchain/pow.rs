// Proof of work
//
// The search is resumable: `PowSearch::step` runs a bounded number of
// attempts and keeps its position, so callers on an async runtime can yield
// between chunks instead of blocking heartbeats and message dispatch.

use super::crypto::hash;

/// Largest difficulty a hex digest can satisfy
pub const MAX_DIFFICULTY: usize = 64;

/// A winning nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowSolution {
    pub nonce: u64,
    pub hash: String,
    pub attempts: u64,
}

/// Whether `digest` starts with `difficulty` zero characters
pub fn meets_difficulty(digest: &str, difficulty: usize) -> bool {
    difficulty <= digest.len() && digest.bytes().take(difficulty).all(|b| b == b'0')
}

/// Hash of `data` followed by the decimal nonce
pub fn hash_with_nonce(data: &str, nonce: u64) -> String {
    hash(format!("{}{}", data, nonce).as_bytes())
}

/// Incremental nonce search over `data`
#[derive(Debug, Clone)]
pub struct PowSearch {
    data: String,
    difficulty: usize,
    next_nonce: u64,
    attempts: u64,
}

impl PowSearch {
    pub fn new(data: impl Into<String>, difficulty: usize) -> Self {
        PowSearch {
            data: data.into(),
            difficulty: difficulty.min(MAX_DIFFICULTY),
            next_nonce: 0,
            attempts: 0,
        }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Runs at most `budget` attempts
    ///
    /// Returns `None` when the budget ran out; the next call continues from
    /// the following nonce.
    pub fn step(&mut self, budget: u64) -> Option<PowSolution> {
        for _ in 0..budget.max(1) {
            let nonce = self.next_nonce;
            let digest = hash_with_nonce(&self.data, nonce);
            self.attempts += 1;
            self.next_nonce = self.next_nonce.wrapping_add(1);

            if meets_difficulty(&digest, self.difficulty) {
                return Some(PowSolution {
                    nonce,
                    hash: digest,
                    attempts: self.attempts,
                });
            }
        }

        None
    }

    /// Runs the search to completion without yielding
    pub fn run(mut self) -> PowSolution {
        loop {
            if let Some(solution) = self.step(u64::MAX) {
                return solution;
            }
        }
    }
}

/// Blocking proof of work, suitable outside the event loop
pub fn proof_of_work(data: &str, difficulty: usize) -> PowSolution {
    PowSearch::new(data, difficulty).run()
}

/// Proof of work that yields to the runtime before every chunk of attempts
pub async fn solve(data: &str, difficulty: usize, chunk_size: u64) -> PowSolution {
    let mut search = PowSearch::new(data, difficulty);

    loop {
        tokio::task::yield_now().await;

        if let Some(solution) = search.step(chunk_size) {
            return solution;
        }
    }
}
