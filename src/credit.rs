//! Credit-based flow control state.
//!
//! Flow control is explicit protocol state, not a poll of queue lengths:
//!
//! - [`OutboundCredit`] counts how many more envelopes the peer has agreed
//!   to buffer. Each send takes one unit; credit grants from the peer add
//!   to it.
//! - [`InboundWindow`] tracks how many slots this side has promised the
//!   peer and decides when to grant more.
//!
//! Both sides start from a small bootstrap credit (default 1) so the first
//! send after channel setup cannot flood a receiver that is not buffering
//! yet. After the first round trip the receiver opens the full window.
//!
//! ```text
//! sender                              receiver
//!   credit=1 ── envelope ─────────────►  reserved 1 → 0 (primes)
//!   credit=0    (blocks)
//!            ◄──────────── grant(100) ── reserved 0 → 100
//!   credit=100 ─ envelope ────────────►  reserved 100 → 99
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default receive buffer capacity (steady-state window).
pub const DEFAULT_CAPACITY: usize = 100;

/// Default credit each side assumes before the first grant.
pub const DEFAULT_BOOTSTRAP_CREDIT: usize = 1;

/// Sends the peer currently allows.
///
/// Lock-free; shared between emitters and the pump that applies grants.
#[derive(Debug)]
pub struct OutboundCredit {
    remaining: AtomicUsize,
    granted: Notify,
}

impl OutboundCredit {
    /// Create a counter holding `initial` units.
    pub fn new(initial: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(initial),
            granted: Notify::new(),
        }
    }

    /// Units currently available.
    #[inline]
    pub fn available(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Take one unit without waiting. Returns `false` when exhausted.
    #[inline]
    pub fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Take one unit, waiting for a grant if necessary.
    ///
    /// Returns `false` if `stop` fires first. Cancel safe: a unit is only
    /// consumed when the future resolves to `true`.
    pub async fn take(&self, stop: &CancellationToken) -> bool {
        loop {
            let granted = self.granted.notified();
            tokio::pin!(granted);
            granted.as_mut().enable();

            if self.try_take() {
                return true;
            }
            if stop.is_cancelled() {
                return false;
            }

            tokio::select! {
                _ = &mut granted => {}
                _ = stop.cancelled() => return false,
            }
        }
    }

    /// Add `units` granted by the peer and wake waiting senders.
    ///
    /// Saturates at `usize::MAX`.
    pub fn grant(&self, units: usize) {
        if units == 0 {
            return;
        }
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_add(units)));
        self.granted.notify_waiters();
    }

    /// Give back a unit taken for a send that failed.
    #[inline]
    pub fn refund(&self) {
        self.grant(1);
    }
}

/// Slots this side has promised to the peer.
#[derive(Debug, Clone)]
pub struct InboundWindow {
    capacity: usize,
    reserved: usize,
    primed: bool,
}

impl InboundWindow {
    /// Create a window; the peer starts with `bootstrap` promised slots.
    pub fn new(capacity: usize, bootstrap: usize) -> Self {
        Self {
            capacity,
            reserved: bootstrap.min(capacity),
            primed: false,
        }
    }

    /// Buffer capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots promised and not yet consumed by the reader.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Credit to grant before the next read, if any.
    ///
    /// The first read only consumes the bootstrap credit. Afterwards the
    /// window is refilled to `capacity` whenever fewer than half of its
    /// slots remain promised. Call [`commit_grant`](Self::commit_grant)
    /// once the grant is actually sent.
    pub fn pending_grant(&mut self) -> Option<usize> {
        if !self.primed {
            self.primed = true;
            return None;
        }
        if self.reserved * 2 < self.capacity {
            Some(self.capacity - self.reserved)
        } else {
            None
        }
    }

    /// Record a grant that was sent to the peer.
    pub fn commit_grant(&mut self, units: usize) {
        self.reserved = (self.reserved + units).min(self.capacity);
    }

    /// Record that the reader took one envelope from the buffer.
    pub fn on_consumed(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_try_take_until_exhausted() {
        let credit = OutboundCredit::new(DEFAULT_BOOTSTRAP_CREDIT);

        assert!(credit.try_take());
        assert!(!credit.try_take());
        assert_eq!(credit.available(), 0);
    }

    #[test]
    fn test_grant_and_refund() {
        let credit = OutboundCredit::new(0);

        credit.grant(3);
        assert_eq!(credit.available(), 3);

        assert!(credit.try_take());
        credit.refund();
        assert_eq!(credit.available(), 3);
    }

    #[test]
    fn test_grant_saturates() {
        let credit = OutboundCredit::new(2);

        credit.grant(usize::MAX);
        assert_eq!(credit.available(), usize::MAX);
        credit.grant(1);
        assert_eq!(credit.available(), usize::MAX);
    }

    #[tokio::test]
    async fn test_take_waits_for_grant() {
        let credit = Arc::new(OutboundCredit::new(0));
        let stop = CancellationToken::new();

        let granter = credit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            granter.grant(2);
        });

        assert!(credit.take(&stop).await);
        assert_eq!(credit.available(), 1);
    }

    #[tokio::test]
    async fn test_take_stops_on_cancel() {
        let credit = OutboundCredit::new(0);
        let stop = CancellationToken::new();

        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert!(!credit.take(&stop).await);
        assert_eq!(credit.available(), 0);
    }

    #[tokio::test]
    async fn test_take_timeout_consumes_nothing() {
        let credit = OutboundCredit::new(0);
        let stop = CancellationToken::new();

        let result = tokio::time::timeout(Duration::from_millis(10), credit.take(&stop)).await;
        assert!(result.is_err());

        credit.grant(1);
        assert_eq!(credit.available(), 1);
    }

    #[test]
    fn test_window_bootstrap_then_full_grant() {
        let mut window = InboundWindow::new(DEFAULT_CAPACITY, DEFAULT_BOOTSTRAP_CREDIT);
        assert_eq!(window.reserved(), 1);

        // First read primes without granting.
        assert_eq!(window.pending_grant(), None);
        window.on_consumed();
        assert_eq!(window.reserved(), 0);

        // Second read opens the full window.
        assert_eq!(window.pending_grant(), Some(100));
        window.commit_grant(100);
        assert_eq!(window.reserved(), 100);
    }

    #[test]
    fn test_window_refills_below_half() {
        let mut window = InboundWindow::new(100, 1);
        window.pending_grant();
        window.on_consumed();
        let grant = window.pending_grant().unwrap();
        window.commit_grant(grant);

        for _ in 0..50 {
            assert_eq!(window.pending_grant(), None);
            window.on_consumed();
        }
        assert_eq!(window.reserved(), 50);
        assert_eq!(window.pending_grant(), None);

        window.on_consumed();
        assert_eq!(window.pending_grant(), Some(51));
    }

    #[test]
    fn test_uncommitted_grant_is_offered_again() {
        let mut window = InboundWindow::new(10, 1);
        window.pending_grant();
        window.on_consumed();

        assert_eq!(window.pending_grant(), Some(10));
        // Not committed (send was cancelled): still owed.
        assert_eq!(window.pending_grant(), Some(10));
    }

    #[test]
    fn test_window_of_one() {
        let mut window = InboundWindow::new(1, 1);
        window.pending_grant();
        window.on_consumed();
        assert_eq!(window.pending_grant(), Some(1));
    }
}
