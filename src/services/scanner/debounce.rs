//! Time-windowed suppression of repeated (object, location) detections

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

type Key = (String, String);

/// Remembers when each (object, location) pair last produced an event
///
/// Entries older than the window are evicted lazily on every call, and the
/// map never holds more than `capacity` pairs (oldest evicted first).
#[derive(Debug)]
pub struct DebounceFilter {
    window: Duration,
    capacity: usize,
    last_emitted: FxHashMap<Key, DateTime<Utc>>,
    /// Emission order; may hold stale entries for keys re-emitted later
    order: VecDeque<(Key, DateTime<Utc>)>,
}

impl DebounceFilter {
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            window: Duration::milliseconds(window_ms.min(i64::MAX as u64) as i64),
            capacity: capacity.max(1),
            last_emitted: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    /// Returns true if the pair should produce an event at `now`
    ///
    /// A suppressed detection does not extend the window.
    pub fn admit(&mut self, object_id: &str, location_id: &str, now: DateTime<Utc>) -> bool {
        self.evict_expired(now);

        let key = (object_id.to_string(), location_id.to_string());
        if let Some(&last) = self.last_emitted.get(&key) {
            if self.within_window(last, now) {
                return false;
            }
        }

        self.last_emitted.insert(key.clone(), now);
        self.order.push_back((key, now));
        while self.last_emitted.len() > self.capacity {
            if !self.pop_oldest() {
                break;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.last_emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_emitted.is_empty()
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        while let Some((_, at)) = self.order.front() {
            if self.within_window(*at, now) {
                break;
            }
            self.pop_oldest();
        }
        if self.order.len() > self.capacity.saturating_mul(2) {
            self.compact();
        }
    }

    /// Distance in either direction, so a clock stepped back by more than
    /// the window does not hold the pair off until it catches up
    fn within_window(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - at).abs() < self.window
    }

    /// Pop the front of the order queue, dropping the map entry if it is current
    fn pop_oldest(&mut self) -> bool {
        let Some((key, at)) = self.order.pop_front() else {
            return false;
        };
        if self.last_emitted.get(&key) == Some(&at) {
            self.last_emitted.remove(&key);
        }
        true
    }

    fn compact(&mut self) {
        let last_emitted = &self.last_emitted;
        self.order.retain(|(key, at)| last_emitted.get(key) == Some(at));
    }
}
