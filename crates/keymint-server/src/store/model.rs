use serde::{Deserialize, Serialize};

/// Stored in redb as bincode-encoded bytes, keyed by `id`.
/// Serialized field names are a stable contract for anything reading the
/// store or the HTTP API alongside this server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    /// UUID v4, assigned at creation.
    pub id: String,
    /// Opaque token from the key generator. Unique, immutable.
    pub key: String,
    /// Unix timestamp (seconds). The license is invalid from this instant on.
    pub expiration_date: i64,
    /// Machine the license is bound to. Set at most once, never cleared
    /// short of deleting the license.
    pub machine_id: Option<String>,
    /// Cleared by a trial reset of the bound machine.
    pub is_active: bool,
    /// Successful validations across all machines.
    pub usage_count: u32,
    /// Unix timestamp of the most recent successful validation.
    pub last_used: Option<i64>,
    pub created_at: i64,
}

impl License {
    /// Returns true if this license has expired at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expiration_date
    }
}

/// One row per client machine, keyed by `machine_id`.
///
/// `needs_trial_reset = true` means the machine is pending a trial reset:
/// `license_key` is null and `blocked_license_key` holds the key that was
/// bound when the reset was issued (or null for a trial machine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub license_key: Option<String>,
    pub needs_trial_reset: bool,
    pub blocked_license_key: Option<String>,
    pub last_seen: i64,
    pub created_at: i64,
}

/// One-time-use fact: at most one record ever exists per
/// (license_id, machine_id) pair. A ledger, not a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub license_id: String,
    pub machine_id: String,
    pub used_at: i64,
}

/// Instance-wide settings, read by collaborators. The validation core never
/// mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Trial length in days.
    pub trial_duration: u32,
    pub max_machines: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            trial_duration: 30,
            max_machines: 1,
        }
    }
}
