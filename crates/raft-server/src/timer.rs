//! # timer
//!
//! why: followers and candidates must notice a silent leader
//! relations: reset by replica.rs on leader contact and granted votes, awaited by the election loop
//! what: ElectionTimer, a randomized deadline that can be pushed back

use parking_lot::Mutex;
use raft_core::RaftConfig;
use tokio::time::{sleep_until, Instant};

/// Randomized election deadline.
///
/// Every reset draws a fresh timeout from the configured range so that
/// replicas rarely time out together.
pub struct ElectionTimer {
    config: RaftConfig,
    deadline: Mutex<Instant>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig) -> Self {
        let deadline = Instant::now() + config.random_election_timeout();
        Self {
            config,
            deadline: Mutex::new(deadline),
        }
    }

    /// push the deadline out by a new random timeout
    pub fn reset(&self) {
        *self.deadline.lock() = Instant::now() + self.config.random_election_timeout();
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Resolve once the deadline passes without a reset in between.
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }
}
