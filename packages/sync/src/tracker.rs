//! # Update Deduplication
//!
//! The event stream delivers updates at least once and not necessarily in
//! order. Each update is tracked under its resolution keys (its refresh
//! paths, or a sentinel for path-less updates) with the highest server time
//! applied so far. An update that is not newer than the marker for any of its
//! keys is dropped.

use crate::model::Update;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Resolution key of updates without refresh paths
pub const SENTINEL_KEY: &str = "";

#[derive(Debug, Clone, Copy)]
struct Marker {
    time: u64,
    touched: Instant,
}

#[derive(Debug, Default)]
pub struct UpdateTracker {
    markers: HashMap<String, Marker>,
    ttl: Option<Duration>,
}

impl UpdateTracker {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            markers: HashMap::new(),
            ttl,
        }
    }

    /// Record `update` and report whether any of its keys was new
    pub fn track(&mut self, update: &Update, now: Instant) -> bool {
        let keys: Vec<&str> = if update.resolve_paths.is_empty() {
            vec![SENTINEL_KEY]
        } else {
            update.resolve_paths.iter().map(String::as_str).collect()
        };

        let mut any_new = false;
        for key in keys {
            match self.markers.get_mut(key) {
                Some(marker) if marker.time >= update.time => {
                    tracing::trace!("Update is already processed, ignoring: {:?}", key);
                }
                Some(marker) => {
                    marker.time = update.time;
                    marker.touched = now;
                    any_new = true;
                }
                None => {
                    self.markers.insert(
                        key.to_string(),
                        Marker {
                            time: update.time,
                            touched: now,
                        },
                    );
                    any_new = true;
                }
            }
        }
        any_new
    }

    /// Keep only updates carrying something new, in arrival order
    pub fn filter_new(&mut self, updates: Vec<Update>, now: Instant) -> Vec<Update> {
        updates
            .into_iter()
            .filter(|update| self.track(update, now))
            .collect()
    }

    pub fn marker(&self, key: &str) -> Option<u64> {
        self.markers.get(key).map(|m| m.time)
    }

    pub fn markers(&self) -> BTreeMap<String, u64> {
        self.markers
            .iter()
            .map(|(key, marker)| (key.clone(), marker.time))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Drop markers untouched for longer than the configured TTL.
    ///
    /// Only meaningful for long-lived sessions; without a TTL nothing is
    /// evicted. Returns the number of markers dropped.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let before = self.markers.len();
        self.markers
            .retain(|_, marker| now.saturating_duration_since(marker.touched) <= ttl);
        let evicted = before - self.markers.len();
        if evicted > 0 {
            tracing::debug!("Evicted {} stale update markers", evicted);
        }
        evicted
    }
}
