//! Per-chat sliding-window rate limiter for destructive operations.
//!
//! Bounds the damage of mass edits/deletions: within one window the first
//! `threshold` operations apply, the excess is denied and the chat stays
//! blocked until the window passes. The first ops having already been
//! applied is the deliberate trade-off between protecting the archive and
//! letting normal activity through.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Edit,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Edit => "edit",
            OperationKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Denied while a block is active.
    RateLimited,
    /// Denied by the operation that crossed the threshold; starts the block.
    RateLimitTriggered,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

#[derive(Debug, Default)]
struct ChatWindow {
    recent: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Aggregate counters, kept for the listener's shutdown report.
#[derive(Debug, Default, Clone)]
pub struct ProtectorStats {
    pub ops_allowed: u64,
    pub ops_blocked: u64,
    pub rate_limits_triggered: u64,
    pub chats_ever_limited: HashSet<i64>,
}

pub struct BurstProtector {
    window: Duration,
    threshold: usize,
    chats: HashMap<i64, ChatWindow>,
    stats: ProtectorStats,
}

impl BurstProtector {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            window,
            threshold,
            chats: HashMap::new(),
            stats: ProtectorStats::default(),
        }
    }

    /// Check one write-bearing operation. Called synchronously from the
    /// listener for every edit/delete; `now` is injected for testability.
    pub fn check(&mut self, chat_id: i64, kind: OperationKind, now: Instant) -> Decision {
        let state = self.chats.entry(chat_id).or_default();

        if let Some(until) = state.blocked_until {
            if now < until {
                self.stats.ops_blocked += 1;
                debug!(chat_id, op = kind.as_str(), "operation denied: rate limited");
                return Decision::RateLimited;
            }
            state.blocked_until = None;
        }

        state.recent.push_back(now);
        let horizon = now.checked_sub(self.window);
        while let Some(front) = state.recent.front() {
            match horizon {
                Some(h) if *front < h => {
                    state.recent.pop_front();
                }
                _ => break,
            }
        }

        if state.recent.len() > self.threshold {
            let overflow = state.recent.len() - self.threshold;
            state.blocked_until = Some(now + self.window);
            self.stats.ops_blocked += 1;
            self.stats.rate_limits_triggered += 1;
            self.stats.chats_ever_limited.insert(chat_id);
            warn!(
                chat_id,
                op = kind.as_str(),
                overflow,
                window_secs = self.window.as_secs(),
                "mass operation detected, blocking further writes for this chat"
            );
            return Decision::RateLimitTriggered;
        }

        self.stats.ops_allowed += 1;
        Decision::Allowed
    }

    pub fn is_blocked(&self, chat_id: i64, now: Instant) -> bool {
        self.chats
            .get(&chat_id)
            .and_then(|s| s.blocked_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Chats with an active block at `now`.
    pub fn currently_blocked(&self, now: Instant) -> Vec<i64> {
        self.chats
            .iter()
            .filter(|(_, s)| s.blocked_until.map(|u| now < u).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn stats(&self) -> &ProtectorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: i64 = -100123456789;

    fn protector() -> BurstProtector {
        BurstProtector::new(10, Duration::from_secs(30))
    }

    #[test]
    fn burst_allows_threshold_then_denies_excess() {
        let mut p = protector();
        let start = Instant::now();
        let mut allowed = 0;
        let mut denied = 0;
        // 50 deletions spread over 5 seconds.
        for i in 0..50u64 {
            let now = start + Duration::from_millis(i * 100);
            match p.check(CHAT, OperationKind::Delete, now) {
                Decision::Allowed => allowed += 1,
                _ => denied += 1,
            }
        }
        assert_eq!(allowed, 10);
        assert_eq!(denied, 40);
        assert_eq!(p.stats().ops_allowed, 10);
        assert_eq!(p.stats().ops_blocked, 40);
        assert_eq!(p.stats().rate_limits_triggered, 1);
        assert!(p.stats().chats_ever_limited.contains(&CHAT));

        // Still blocked well past the burst.
        assert!(p.is_blocked(CHAT, start + Duration::from_secs(29)));
        assert_eq!(p.currently_blocked(start + Duration::from_secs(29)), vec![CHAT]);
        // The block lapses once the window passes.
        assert!(!p.is_blocked(CHAT, start + Duration::from_secs(32)));
    }

    #[test]
    fn slow_operations_never_trip() {
        let mut p = protector();
        let start = Instant::now();
        for i in 0..100u64 {
            let now = start + Duration::from_secs(i * 4);
            assert_eq!(p.check(CHAT, OperationKind::Edit, now), Decision::Allowed);
        }
        assert_eq!(p.stats().rate_limits_triggered, 0);
    }

    #[test]
    fn block_clears_lazily_and_allows_again() {
        let mut p = protector();
        let start = Instant::now();
        for i in 0..12u64 {
            p.check(CHAT, OperationKind::Delete, start + Duration::from_millis(i));
        }
        assert!(p.is_blocked(CHAT, start + Duration::from_secs(1)));
        // First check after expiry unblocks and is admitted.
        let later = start + Duration::from_secs(61);
        assert_eq!(p.check(CHAT, OperationKind::Delete, later), Decision::Allowed);
        assert!(!p.is_blocked(CHAT, later));
    }

    #[test]
    fn chats_are_isolated() {
        let mut p = protector();
        let start = Instant::now();
        for i in 0..20u64 {
            p.check(CHAT, OperationKind::Delete, start + Duration::from_millis(i));
        }
        assert_eq!(
            p.check(-42, OperationKind::Delete, start + Duration::from_millis(20)),
            Decision::Allowed
        );
    }

    #[test]
    fn exactly_min_n_t_ops_apply_for_any_burst() {
        // Property: a window holding N ops with threshold T applies
        // min(N, T) and denies max(0, N - T).
        for n in [1usize, 5, 10, 11, 30] {
            let mut p = protector();
            let start = Instant::now();
            let allowed = (0..n)
                .filter(|i| {
                    p.check(CHAT, OperationKind::Delete, start + Duration::from_millis(*i as u64))
                        .is_allowed()
                })
                .count();
            assert_eq!(allowed, n.min(10), "n = {n}");
        }
    }
}
