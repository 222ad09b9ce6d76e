//! Shared observable state for one transfer in flight.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::TransferError;

/// Phase a transfer is currently in. Downloads walk Resolving through
/// Complete in order; uploads use Sealing and Uploading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferPhase {
    Idle = 0,
    Sealing = 1,
    Uploading = 2,
    Resolving = 3,
    Fetching = 4,
    Verifying = 5,
    Decrypting = 6,
    Complete = 7,
}

impl TransferPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TransferPhase::Sealing,
            2 => TransferPhase::Uploading,
            3 => TransferPhase::Resolving,
            4 => TransferPhase::Fetching,
            5 => TransferPhase::Verifying,
            6 => TransferPhase::Decrypting,
            7 => TransferPhase::Complete,
            _ => TransferPhase::Idle,
        }
    }
}

/// Cancellation flag that can be flipped from another task or a signal
/// handler. Coordinators poll it between chunks, so a cancel lands within
/// one chunk of work.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress and cancellation handle for one transfer. Clone it to watch a
/// transfer from elsewhere; all clones share the same state.
#[derive(Clone, Default)]
pub struct TransferSession {
    inner: Arc<SessionState>,
}

#[derive(Default)]
struct SessionState {
    phase: AtomicU8,
    bytes_done: AtomicU64,
    // 0 means "total unknown"; a genuine zero-byte record reads the same,
    // which costs nothing but a missing percentage display.
    bytes_total: AtomicU64,
    cancel: CancelHandle,
}

impl TransferSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.inner.cancel.clone()
    }

    pub fn phase(&self) -> TransferPhase {
        TransferPhase::from_u8(self.inner.phase.load(Ordering::Relaxed))
    }

    pub(crate) fn set_phase(&self, phase: TransferPhase) {
        self.inner.phase.store(phase as u8, Ordering::Relaxed);
        tracing::debug!(?phase, "transfer phase");
    }

    /// Bytes moved so far and the expected total, when the remote side
    /// advertised one.
    pub fn progress(&self) -> (u64, Option<u64>) {
        let done = self.inner.bytes_done.load(Ordering::Relaxed);
        let total = match self.inner.bytes_total.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        };
        (done, total)
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.inner.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn reset_bytes(&self) {
        self.inner.bytes_done.store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.inner.bytes_total.store(total, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_all_clones() {
        let session = TransferSession::new();
        let watcher = session.clone();
        let handle = session.cancel_handle();

        assert!(session.check_cancelled().is_ok());
        handle.cancel();
        assert!(watcher.is_cancelled());
        assert!(matches!(
            session.check_cancelled().unwrap_err(),
            TransferError::Cancelled
        ));
    }

    #[test]
    fn progress_accumulates_and_resets() {
        let session = TransferSession::new();
        assert_eq!(session.progress(), (0, None));

        session.set_total(100);
        session.add_bytes(30);
        session.add_bytes(20);
        assert_eq!(session.progress(), (50, Some(100)));

        session.reset_bytes();
        assert_eq!(session.progress(), (0, Some(100)));
    }

    #[test]
    fn phase_round_trips_through_storage() {
        let session = TransferSession::new();
        assert_eq!(session.phase(), TransferPhase::Idle);
        for phase in [
            TransferPhase::Resolving,
            TransferPhase::Fetching,
            TransferPhase::Verifying,
            TransferPhase::Decrypting,
            TransferPhase::Complete,
        ] {
            session.set_phase(phase);
            assert_eq!(session.phase(), phase);
        }
    }
}
