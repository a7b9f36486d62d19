use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use tokio::sync::oneshot;
use tracing::debug;

use super::ChallengeOutcome;

/// Create the two halves of a single challenge.
///
/// The responder goes to the platform driver, the pending half is awaited by
/// the orchestrator. Resolution consumes the responder, so a challenge can
/// complete at most once.
pub fn challenge_channel() -> (ChallengeResponder, PendingChallenge) {
    let (tx, rx) = oneshot::channel();
    let failed_attempts = Arc::new(AtomicU32::new(0));
    (
        ChallengeResponder {
            tx,
            failed_attempts: failed_attempts.clone(),
        },
        PendingChallenge { rx, failed_attempts },
    )
}

#[derive(Debug)]
pub struct ChallengeResponder {
    tx: oneshot::Sender<ChallengeOutcome>,
    failed_attempts: Arc<AtomicU32>,
}

impl ChallengeResponder {
    /// Deliver the terminal outcome.
    pub fn resolve(self, outcome: ChallengeOutcome) {
        if self.tx.send(outcome).is_err() {
            debug!("challenge resolved after the operation was dropped");
        }
    }

    /// Record an unrecognized attempt. The prompt stays up; this does not resolve.
    pub fn failed_attempt(&self) {
        let attempts = self.failed_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(attempts, "authentication attempt not recognized");
    }
}

#[derive(Debug)]
pub struct PendingChallenge {
    rx: oneshot::Receiver<ChallengeOutcome>,
    failed_attempts: Arc<AtomicU32>,
}

impl PendingChallenge {
    /// Wait for the driver. A driver that drops its responder without
    /// answering is treated as a canceled session.
    pub async fn outcome(self) -> ChallengeOutcome {
        let outcome = self.rx.await.unwrap_or(ChallengeOutcome::SessionCanceled);
        let failed = self.failed_attempts.load(Ordering::Relaxed);
        if failed > 0 {
            debug!(failed, ?outcome, "challenge finished after failed attempts");
        }
        outcome
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Relaxed)
    }
}
