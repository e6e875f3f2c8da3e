//! In-memory device registry: per-device profile and daily quota counters.
//!
//! Profiles are never evicted; they live until process restart.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::category::Category;

/// Per-category match counters for a single calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCounterSet {
    date: NaiveDate,
    counts: [u32; 4],
}

impl DailyCounterSet {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            counts: [0; 4],
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Reset all counts if `today` is a different day. Returns true on rollover.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.date == today {
            return false;
        }
        self.date = today;
        self.counts = [0; 4];
        true
    }

    pub fn count(&self, category: Category) -> u32 {
        self.counts[category.index()]
    }

    /// Increment the counter for `category` unless it has reached `quota`.
    /// Returns false (and leaves the counter untouched) when the quota is spent.
    pub fn try_increment(&mut self, category: Category, quota: u32) -> bool {
        let slot = &mut self.counts[category.index()];
        if *slot >= quota {
            return false;
        }
        *slot += 1;
        true
    }

    pub fn remaining(&self, quota: u32) -> RemainingLimits {
        let left = |c: Category| quota.saturating_sub(self.count(c));
        RemainingLimits {
            male: left(Category::Male),
            female: left(Category::Female),
            non_binary: left(Category::NonBinary),
            prefer_not_to_say: left(Category::PreferNotToSay),
        }
    }

    pub fn counts(&self) -> DailyCounts {
        DailyCounts {
            male: self.count(Category::Male),
            female: self.count(Category::Female),
            non_binary: self.count(Category::NonBinary),
            prefer_not_to_say: self.count(Category::PreferNotToSay),
        }
    }
}

/// Remaining matches for the day, per category. Wire shape of `limits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainingLimits {
    pub male: u32,
    pub female: u32,
    #[serde(rename = "non-binary")]
    pub non_binary: u32,
    #[serde(rename = "prefer-not-to-say")]
    pub prefer_not_to_say: u32,
}

/// Snapshot of consumed counts, handed to the quota synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DailyCounts {
    pub male: u32,
    pub female: u32,
    pub non_binary: u32,
    pub prefer_not_to_say: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub category: Option<Category>,
    pub nickname: Option<String>,
    pub daily: DailyCounterSet,
    pub last_join: Option<DateTime<Utc>>,
}

impl DeviceProfile {
    fn new(today: NaiveDate) -> Self {
        Self {
            category: None,
            nickname: None,
            daily: DailyCounterSet::new(today),
            last_join: None,
        }
    }
}

/// Profile as shown to a matched peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerProfile {
    pub nickname: String,
    pub gender: Option<Category>,
}

const ANONYMOUS_NICKNAME: &str = "Anon";

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceProfile>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceProfile> {
        self.devices.get(device_id)
    }

    /// Fetch (creating if needed) a profile, applying day rollover first.
    /// The bool is true when the counters were reset by this call.
    pub fn touch(&mut self, device_id: &str, today: NaiveDate) -> (&mut DeviceProfile, bool) {
        let mut created = false;
        let profile = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                created = true;
                DeviceProfile::new(today)
            });
        let rolled = profile.daily.roll_over(today);
        (profile, rolled && !created)
    }

    pub fn remaining(&mut self, device_id: &str, today: NaiveDate, quota: u32) -> RemainingLimits {
        let (profile, _) = self.touch(device_id, today);
        profile.daily.remaining(quota)
    }

    pub fn peer_profile(&self, device_id: &str) -> PeerProfile {
        let profile = self.devices.get(device_id);
        PeerProfile {
            nickname: profile
                .and_then(|p| p.nickname.clone())
                .unwrap_or_else(|| ANONYMOUS_NICKNAME.to_string()),
            gender: profile.and_then(|p| p.category),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceProfile)> {
        self.devices.iter().map(|(id, p)| (id.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
