//! Core domain model for the announcement relay: canonical items and the delivery watermark.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "relay-core";

/// Upper bound on the number of ids remembered in the seen-set.
pub const RECENT_IDS_CAP: usize = 500;

/// Announcement in the shape every downstream stage consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub title: String,
    pub author: String,
    pub url: String,
    pub body: String,
}

/// Orders items newest first. Items without a timestamp sort last; ties keep input order.
pub fn sort_newest_first(items: &mut [CanonicalItem]) {
    items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Bounded insertion-ordered id set. The oldest id is evicted once the cap is exceeded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct RecentIds {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecentIds {
    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Records `id` as the most recent entry. Re-inserting an existing id moves it to the back.
    pub fn insert(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.members.contains(&id) {
            self.order.retain(|existing| existing != &id);
        } else {
            self.members.insert(id.clone());
        }
        self.order.push_back(id);

        while self.order.len() > RECENT_IDS_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }
}

impl From<Vec<String>> for RecentIds {
    fn from(ids: Vec<String>) -> Self {
        let mut recent = RecentIds::default();
        for id in ids {
            recent.insert(id);
        }
        recent
    }
}

impl From<RecentIds> for Vec<String> {
    fn from(recent: RecentIds) -> Self {
        recent.order.into_iter().collect()
    }
}

/// Delivery watermark: the newest timestamp fully delivered plus the recently delivered ids.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkState {
    #[serde(default)]
    pub last_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recent_ids: RecentIds,
}

impl WatermarkState {
    /// Boot state when no durable state exists: an optional seed instant and no seen ids.
    pub fn seeded(start_from: Option<DateTime<Utc>>) -> Self {
        Self {
            last_timestamp: start_from,
            recent_ids: RecentIds::default(),
        }
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.recent_ids.contains(id)
    }

    pub fn seen_count(&self) -> usize {
        self.recent_ids.len()
    }

    /// Returns the state after a fully delivered batch.
    ///
    /// The watermark only moves forward: `observed_newest` replaces the current value
    /// when it is later, and is ignored otherwise.
    pub fn committed<'a>(
        &self,
        observed_newest: Option<DateTime<Utc>>,
        delivered_ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let last_timestamp = match (self.last_timestamp, observed_newest) {
            (Some(prev), Some(seen)) => Some(prev.max(seen)),
            (prev, seen) => prev.or(seen),
        };
        let mut recent_ids = self.recent_ids.clone();
        for id in delivered_ids {
            recent_ids.insert(id);
        }
        Self {
            last_timestamp,
            recent_ids,
        }
    }
}

/// Point-in-time view of the relay exposed by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub ok: bool,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub seen_count: usize,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_ok: Option<bool>,
}

impl StatusSnapshot {
    pub fn from_state(state: &WatermarkState) -> Self {
        Self {
            ok: true,
            last_timestamp: state.last_timestamp,
            seen_count: state.seen_count(),
            last_cycle_at: None,
            last_cycle_ok: None,
        }
    }

    pub fn with_cycle(mut self, at: DateTime<Utc>, ok: bool) -> Self {
        self.last_cycle_at = Some(at);
        self.last_cycle_ok = Some(ok);
        self
    }
}
