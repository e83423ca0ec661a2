//! Timer wiring.
//!
//! The engine does not run its own clock. It schedules [`TimerHandle`]s
//! against an external timer wheel that fires at a fixed tick granularity
//! and calls back into [`TransactionEngine::on_timer`]. Timers are
//! cooperative: a fired callback re-acquires the relevant locks itself and
//! re-validates any decision it made before firing.
//!
//! [`TransactionEngine::on_timer`]: crate::engine::TransactionEngine::on_timer

use std::time::Duration;

use crate::table::CellId;

/// The timer classes a transaction uses.
///
/// Branch timers carry the branch index so a single wheel entry maps back to
/// the exact piece of state it governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Retransmits the branch's current retransmission buffer with
    /// exponential backoff.
    BranchRetransmit(u16),
    /// Final-response timeout for the branch; fires a synthesized 408 into
    /// the reply path.
    BranchFinal(u16),
    /// Retransmits the last reply sent upstream (negative INVITE finals).
    UasRetransmit,
    /// Grace period after the transaction reached a terminal state;
    /// firing attempts destruction.
    Wait,
    /// Destruction retry when the wait timer found the cell still
    /// referenced.
    Delete,
}

/// One schedulable timer: a transaction identity plus the timer class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    pub cell: CellId,
    pub kind: TimerKind,
}

impl TimerHandle {
    pub fn new(cell: CellId, kind: TimerKind) -> Self {
        Self { cell, kind }
    }
}

/// External timer wheel boundary.
///
/// `schedule` arms (or re-arms) the handle `delay_ticks` ticks from now;
/// `cancel` disarms it if still pending. Both must be safe to call from any
/// worker. The wheel owns nothing: a fired handle the engine no longer knows
/// is simply ignored by `on_timer`.
pub trait TimerWheel: Send + Sync {
    fn schedule(&self, handle: TimerHandle, delay_ticks: u64);
    fn cancel(&self, handle: TimerHandle);
}

impl<W: TimerWheel + ?Sized> TimerWheel for std::sync::Arc<W> {
    fn schedule(&self, handle: TimerHandle, delay_ticks: u64) {
        (**self).schedule(handle, delay_ticks)
    }

    fn cancel(&self, handle: TimerHandle) {
        (**self).cancel(handle)
    }
}

/// Timer durations, RFC 3261 names where they exist.
#[derive(Debug, Clone, Copy)]
pub struct TimerSettings {
    /// RTT estimate; initial retransmission interval.
    pub t1: Duration,
    /// Retransmission interval ceiling for non-INVITE requests and replies.
    pub t2: Duration,
    /// Final-response timeout for non-INVITE branches.
    pub fr: Duration,
    /// Final-response timeout for INVITE branches (callees ring for a
    /// while).
    pub fr_inv: Duration,
    /// Grace period before destruction once the transaction is terminal.
    pub wait: Duration,
    /// Retry interval when destruction found the cell still referenced.
    pub delete_retry: Duration,
    /// Wheel tick granularity.
    pub tick: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            fr: Duration::from_secs(30),
            fr_inv: Duration::from_secs(120),
            wait: Duration::from_secs(5),
            delete_retry: Duration::from_millis(200),
            tick: Duration::from_millis(500),
        }
    }
}

impl TimerSettings {
    /// Converts a duration to wheel ticks, rounding up so a nonzero
    /// duration never schedules for "now".
    pub fn ticks(&self, d: Duration) -> u64 {
        let tick = self.tick.as_millis().max(1);
        let ms = d.as_millis();
        (ms.div_ceil(tick)) as u64
    }
}

/// Next retransmission interval: doubles, optionally clamped at `cap`.
///
/// INVITE requests double unbounded (the FR timer bounds the branch);
/// non-INVITE requests and reply retransmissions clamp at T2.
pub fn next_backoff(current: Duration, cap: Option<Duration>) -> Duration {
    let doubled = current.saturating_mul(2);
    match cap {
        Some(cap) => doubled.min(cap),
        None => doubled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_round_up() {
        let s = TimerSettings::default();
        assert_eq!(s.ticks(Duration::from_millis(500)), 1);
        assert_eq!(s.ticks(Duration::from_millis(501)), 2);
        assert_eq!(s.ticks(Duration::from_secs(30)), 60);
        assert_eq!(s.ticks(Duration::ZERO), 0);
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let t1 = Duration::from_millis(500);
        let t2 = Duration::from_secs(4);
        let mut cur = t1;
        let mut seen = Vec::new();
        for _ in 0..5 {
            cur = next_backoff(cur, Some(t2));
            seen.push(cur.as_millis());
        }
        assert_eq!(seen, vec![1000, 2000, 4000, 4000, 4000]);
    }

    #[test]
    fn backoff_unbounded_for_invite() {
        let mut cur = Duration::from_millis(500);
        for _ in 0..6 {
            cur = next_backoff(cur, None);
        }
        assert_eq!(cur.as_millis(), 32_000);
    }
}
