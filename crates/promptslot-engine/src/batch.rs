//! Autonomous-mode window and the one-at-a-time batch sequencer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use promptslot_contracts::ContentKey;

use crate::mutator::Candidate;

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    GenerationFinished,
    MessageSwiped,
    MessageModified,
}

/// Short-lived permission for scans to auto-fire their cache misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoModeWindow {
    expires_at: Option<Instant>,
}

impl AutoModeWindow {
    pub fn arm(&mut self, now: Instant, length: Duration) {
        self.expires_at = Some(now + length);
    }

    pub fn disarm(&mut self) {
        self.expires_at = None;
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now < expires_at)
    }

    /// Applies a host lifecycle signal; returns whether the window is now armed.
    pub fn on_signal(&mut self, signal: HostSignal, now: Instant, length: Duration) -> bool {
        match signal {
            HostSignal::GenerationFinished | HostSignal::MessageSwiped => {
                self.arm(now, length);
                true
            }
            HostSignal::MessageModified => {
                self.disarm();
                false
            }
        }
    }
}

/// Fires queued candidates strictly one at a time: the next one becomes due only
/// after the outstanding key's response has been correlated, plus the interval.
#[derive(Debug, Default)]
pub struct BatchSequencer {
    queue: VecDeque<Candidate>,
    outstanding: Option<ContentKey>,
    ready_at: Option<Instant>,
}

impl BatchSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues candidates already sorted top-to-bottom. Keys already queued or
    /// outstanding are not queued twice.
    pub fn enqueue(&mut self, candidates: impl IntoIterator<Item = Candidate>) -> usize {
        let mut added = 0;
        for candidate in candidates {
            let duplicate = self.outstanding.as_ref() == Some(&candidate.key)
                || self.queue.iter().any(|queued| queued.key == candidate.key);
            if !duplicate {
                self.queue.push_back(candidate);
                added += 1;
            }
        }
        added
    }

    /// Pops the next candidate if nothing is outstanding and the interval has passed.
    pub fn next_due(&mut self, now: Instant) -> Option<Candidate> {
        if self.outstanding.is_some() {
            return None;
        }
        if self.ready_at.is_some_and(|ready_at| now < ready_at) {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn mark_outstanding(&mut self, key: ContentKey) {
        self.outstanding = Some(key);
    }

    /// Returns true when `key` was the outstanding one and the queue may move on.
    pub fn on_correlated(&mut self, key: &ContentKey, now: Instant, interval: Duration) -> bool {
        if self.outstanding.as_ref() != Some(key) {
            return false;
        }
        self.outstanding = None;
        self.ready_at = Some(now + interval);
        true
    }

    pub fn outstanding(&self) -> Option<&ContentKey> {
        self.outstanding.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none() && self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::DocHandle;
    use crate::dom::Id;

    fn candidate(content: &str, trigger: u32) -> Candidate {
        Candidate {
            handle: DocHandle::PRIMARY,
            trigger: Id(trigger),
            key: ContentKey::derive(content),
            content: content.to_string(),
        }
    }

    #[test]
    fn window_expires_and_modification_disarms() {
        let clock = ManualClock::new();
        let mut window = AutoModeWindow::default();
        assert!(!window.is_active(clock.now()));

        assert!(window.on_signal(
            HostSignal::GenerationFinished,
            clock.now(),
            Duration::from_millis(100)
        ));
        clock.advance(Duration::from_millis(99));
        assert!(window.is_active(clock.now()));
        clock.advance(Duration::from_millis(1));
        assert!(!window.is_active(clock.now()));

        window.on_signal(HostSignal::MessageSwiped, clock.now(), Duration::from_secs(5));
        window.on_signal(HostSignal::MessageModified, clock.now(), Duration::from_secs(5));
        assert!(!window.is_active(clock.now()));
    }

    #[test]
    fn sequencer_waits_for_correlation_and_interval() {
        let clock = ManualClock::new();
        let mut sequencer = BatchSequencer::new();
        assert_eq!(
            sequencer.enqueue(vec![candidate("a", 1), candidate("b", 2), candidate("a", 3)]),
            2
        );

        let first = sequencer.next_due(clock.now());
        assert_eq!(first.as_ref().map(|c| c.content.as_str()), Some("a"));
        sequencer.mark_outstanding(ContentKey::derive("a"));
        assert!(sequencer.next_due(clock.now()).is_none());

        assert!(!sequencer.on_correlated(
            &ContentKey::derive("zzz"),
            clock.now(),
            Duration::from_millis(50)
        ));
        assert!(sequencer.on_correlated(
            &ContentKey::derive("a"),
            clock.now(),
            Duration::from_millis(50)
        ));
        assert!(sequencer.next_due(clock.now()).is_none());
        clock.advance(Duration::from_millis(50));
        let second = sequencer.next_due(clock.now());
        assert_eq!(second.map(|c| c.content), Some("b".to_string()));
        assert!(sequencer.is_idle());
    }
}
