//! Ban registry with lazy expiry.
//!
//! Temporary bans are not swept by a timer: a stale record is deleted the
//! next time it is looked up, and the caller resets the device's report
//! counter when that happens.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BanKind {
    Temporary,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BanRecord {
    pub reason: String,
    pub issued_at: DateTime<Utc>,
    pub kind: BanKind,
}

impl BanRecord {
    pub fn expires_at(&self, temporary_ttl: Duration) -> Option<DateTime<Utc>> {
        match self.kind {
            BanKind::Temporary => Some(self.issued_at + temporary_ttl),
            BanKind::Permanent => None,
        }
    }
}

/// Result of a ban lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanStatus {
    Active(BanRecord),
    /// A temporary ban was found past its expiry and removed by this lookup.
    Expired,
    Clean,
}

#[derive(Debug)]
pub struct BanRegistry {
    bans: HashMap<String, BanRecord>,
    temporary_ttl: Duration,
}

impl BanRegistry {
    pub fn new(temporary_ttl: Duration) -> Self {
        Self {
            bans: HashMap::new(),
            temporary_ttl,
        }
    }

    /// Authoritative check. Deletes a temporary ban once `now` reaches its expiry.
    pub fn check(&mut self, device_id: &str, now: DateTime<Utc>) -> BanStatus {
        let Some(record) = self.bans.get(device_id) else {
            return BanStatus::Clean;
        };
        match record.expires_at(self.temporary_ttl) {
            Some(expiry) if now >= expiry => {
                self.bans.remove(device_id);
                BanStatus::Expired
            }
            _ => BanStatus::Active(record.clone()),
        }
    }

    /// Record a ban and return the one now in force. A permanent ban is never
    /// downgraded by a later temporary one.
    pub fn issue(&mut self, device_id: &str, record: BanRecord) -> BanRecord {
        if let Some(existing) = self.bans.get(device_id) {
            if existing.kind == BanKind::Permanent && record.kind == BanKind::Temporary {
                return existing.clone();
            }
        }
        self.bans.insert(device_id.to_string(), record.clone());
        record
    }

    /// Whether a record is held, without applying expiry.
    pub fn contains(&self, device_id: &str) -> bool {
        self.bans.contains_key(device_id)
    }

    pub fn lift(&mut self, device_id: &str) -> Option<BanRecord> {
        self.bans.remove(device_id)
    }

    pub fn temporary_ttl(&self) -> Duration {
        self.temporary_ttl
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}
