//! Event subscriptions
//!
//! A subscription lasts `duration_ms` from `start_ms`. It is never extended
//! in place: a re-SUBSCRIBE replaces it with a fresh record.

/// One subscription to a named event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubscription {
    pub event: String,
    pub duration_ms: u64,
    pub start_ms: u64,
}

impl EventSubscription {
    pub fn new(event: impl Into<String>, duration_ms: u64, start_ms: u64) -> Self {
        Self {
            event: event.into(),
            duration_ms,
            start_ms,
        }
    }

    pub fn expires_at(&self) -> u64 {
        self.start_ms.saturating_add(self.duration_ms)
    }

    /// Active up to and including `start + duration`
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms <= self.expires_at()
    }

    /// Due for a re-SUBSCRIBE `margin_ms` before it runs out
    pub fn needs_refresh(&self, now_ms: u64, margin_ms: u64) -> bool {
        now_ms.saturating_add(margin_ms) >= self.expires_at()
    }
}

/// Insert `sub`, replacing any subscription to the same event
pub fn replace(list: &mut Vec<EventSubscription>, sub: EventSubscription) {
    match list.iter_mut().find(|s| s.event == sub.event) {
        Some(existing) => *existing = sub,
        None => list.push(sub),
    }
}

pub fn remove(list: &mut Vec<EventSubscription>, event: &str) {
    list.retain(|s| s.event != event);
}

/// Whether `list` holds an active subscription to `event`
pub fn is_subscribed(list: &[EventSubscription], event: &str, now_ms: u64) -> bool {
    list.iter().any(|s| s.event == event && s.is_active(now_ms))
}

/// Drop expired subscriptions, returning how many went
pub fn prune(list: &mut Vec<EventSubscription>, now_ms: u64) -> usize {
    let before = list.len();
    list.retain(|s| s.is_active(now_ms));
    before - list.len()
}
