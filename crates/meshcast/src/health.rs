//! Per-member sender health shared by the dispatchers of a pool.
//!
//! The health tag only decides log severity and, optionally, whether a
//! member is skipped outright. Retries are governed by the dispatcher.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::member::Member;

const STATE_READY: u8 = 0;
const STATE_SUSPECT: u8 = 1;
const STATE_FAILING: u8 = 2;

/// Health of the sending path to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SenderState {
    /// Last send succeeded (or nothing was sent yet).
    #[default]
    Ready,
    /// A send failed and is being retried.
    Suspect,
    /// A send failed permanently.
    Failing,
}

impl From<u8> for SenderState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_SUSPECT => SenderState::Suspect,
            STATE_FAILING => SenderState::Failing,
            _ => SenderState::Ready,
        }
    }
}

impl From<SenderState> for u8 {
    fn from(state: SenderState) -> Self {
        match state {
            SenderState::Ready => STATE_READY,
            SenderState::Suspect => STATE_SUSPECT,
            SenderState::Failing => STATE_FAILING,
        }
    }
}

/// Health entry for one member.
#[derive(Debug, Default)]
pub struct MemberHealth {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
}

impl MemberHealth {
    /// Current state.
    pub fn state(&self) -> SenderState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Marks the member ready; returns the previous state.
    pub fn record_success(&self) -> SenderState {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.swap(SenderState::Ready)
    }

    /// Marks the member suspect after a retryable failure; returns the previous state.
    ///
    /// A failing member stays failing until it succeeds again.
    pub fn record_suspect(&self) -> SenderState {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        let prev = self.state.fetch_max(STATE_SUSPECT, Ordering::AcqRel);
        prev.into()
    }

    /// Marks the member failing; returns the previous state.
    pub fn record_failing(&self) -> SenderState {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.swap(SenderState::Failing)
    }

    fn swap(&self, state: SenderState) -> SenderState {
        self.state.swap(state.into(), Ordering::AcqRel).into()
    }
}

/// Health of every member seen by a pool.
///
/// Entries are handed out as `Arc`s so no map shard lock is held while a
/// dispatcher does I/O.
#[derive(Debug, Default)]
pub struct SenderStates {
    members: DashMap<Member, Arc<MemberHealth>>,
}

impl SenderStates {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `member`, creating a ready one if needed.
    pub fn entry(&self, member: &Member) -> Arc<MemberHealth> {
        if let Some(health) = self.members.get(member) {
            return Arc::clone(health.value());
        }
        Arc::clone(self.members.entry(member.clone()).or_default().value())
    }

    /// State of `member`; unknown members are ready.
    pub fn state(&self, member: &Member) -> SenderState {
        self.members
            .get(member)
            .map(|h| h.state())
            .unwrap_or_default()
    }

    /// Forgets a member.
    pub fn remove(&self, member: &Member) -> bool {
        self.members.remove(member).is_some()
    }

    /// Number of tracked members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when no member is tracked.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members currently marked failing.
    pub fn failing_members(&self) -> Vec<Member> {
        self.members
            .iter()
            .filter(|e| e.value().state() == SenderState::Failing)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [SenderState::Ready, SenderState::Suspect, SenderState::Failing] {
            let raw: u8 = state.into();
            assert_eq!(SenderState::from(raw), state);
        }
        assert_eq!(SenderState::from(200), SenderState::Ready);
    }

    #[test]
    fn test_transitions() {
        let health = MemberHealth::default();
        assert_eq!(health.state(), SenderState::Ready);

        assert_eq!(health.record_suspect(), SenderState::Ready);
        assert_eq!(health.state(), SenderState::Suspect);

        assert_eq!(health.record_failing(), SenderState::Suspect);
        assert_eq!(health.record_suspect(), SenderState::Failing);
        assert_eq!(health.state(), SenderState::Failing);
        assert_eq!(health.consecutive_failures(), 3);

        assert_eq!(health.record_success(), SenderState::Failing);
        assert_eq!(health.state(), SenderState::Ready);
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn test_registry_shares_entries() {
        let states = SenderStates::new();
        let m = Member::new("10.0.0.1", 4000);
        assert_eq!(states.state(&m), SenderState::Ready);
        assert!(states.is_empty());

        let a = states.entry(&m);
        let b = states.entry(&m);
        a.record_failing();
        assert_eq!(b.state(), SenderState::Failing);
        assert_eq!(states.state(&m), SenderState::Failing);
        assert_eq!(states.failing_members(), vec![m.clone()]);
        assert_eq!(states.len(), 1);

        assert!(states.remove(&m));
        assert!(!states.remove(&m));
    }

    #[test]
    fn test_concurrent_updates() {
        let states = Arc::new(SenderStates::new());
        let m = Member::new("10.0.0.2", 4000);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let states = Arc::clone(&states);
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        states.entry(&m).record_suspect();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(states.entry(&m).consecutive_failures(), 800);
        assert_eq!(states.len(), 1);
    }
}
