//! The persistence port — the only surface the core talks to storage
//! through.
//!
//! Besides plain CRUD, the port carries the two primitives every backend
//! must provide for the protocol to be race-safe: a conditional first-bind
//! (`bind_if_unset`) and a unique-or-reject usage insert
//! (`insert_usage_once`). Both are modeled as explicit operations rather
//! than read-then-write sequences so the guarantees live in one place per
//! adapter.

use anyhow::Result;

use super::model::{License, Machine, Settings, UsageRecord};

/// Outcome of a conditional first-time bind.
#[derive(Debug, Clone, PartialEq)]
pub enum BindOutcome {
    /// The license had no bound machine; it is now bound to the caller.
    Bound,
    /// Another machine id was already bound (possibly by a concurrent
    /// winner). Carries the bound id so the caller can re-evaluate.
    AlreadyBound(String),
}

/// Outcome of a unique usage-ledger insert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UsageInsert {
    Inserted,
    /// A record for this (license, machine) pair already existed — the
    /// uniqueness constraint fired. A business outcome, not an error.
    Duplicate,
}

/// Durable storage for licenses, machines, the usage ledger and settings.
///
/// Implementations must be safe to share across request handlers; every
/// method is a single short transaction against the backing store.
pub trait Persistence: Send + Sync {
    // ── Licenses ─────────────────────────────────────────────────────────

    /// Insert a freshly issued license. Fails if the key is already taken.
    fn insert_license(&self, license: &License) -> Result<()>;

    fn license_by_id(&self, id: &str) -> Result<Option<License>>;

    fn license_by_key(&self, key: &str) -> Result<Option<License>>;

    /// All licenses, newest first.
    fn list_licenses(&self) -> Result<Vec<License>>;

    /// Delete a license by id. Returns true if it existed.
    fn delete_license(&self, id: &str) -> Result<bool>;

    /// Set `machine_id` on the license only if it is still unset.
    /// The check and the write happen in one transaction.
    fn bind_if_unset(&self, license_id: &str, machine_id: &str) -> Result<BindOutcome>;

    /// Bump `usage_count` and stamp `last_used` after a successful
    /// validation.
    fn record_license_use(&self, license_id: &str, now: i64) -> Result<()>;

    // ── Usage ledger ─────────────────────────────────────────────────────

    /// Insert the one-time-use fact for (license, machine), or report
    /// `Duplicate` if the pair was already recorded.
    fn insert_usage_once(&self, license_id: &str, machine_id: &str, used_at: i64)
        -> Result<UsageInsert>;

    fn usage_exists(&self, license_id: &str, machine_id: &str) -> Result<bool>;

    fn usage_for_license(&self, license_id: &str) -> Result<Vec<UsageRecord>>;

    // ── Machines ─────────────────────────────────────────────────────────

    fn machine(&self, machine_id: &str) -> Result<Option<Machine>>;

    /// All machines, most recently seen first.
    fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Insert or fully replace a machine row.
    fn upsert_machine(&self, machine: &Machine) -> Result<()>;

    /// Update `last_seen` only. Returns false if the machine is unknown —
    /// this never creates a row.
    fn touch_machine(&self, machine_id: &str, now: i64) -> Result<bool>;

    /// Arm a trial reset in one transaction: deactivate every license bound
    /// to the machine, move its bound key into `blocked_license_key`, null
    /// the key and raise `needs_trial_reset`. Returns the updated machine,
    /// or `None` if the machine is unknown (nothing is touched).
    fn arm_trial_reset(&self, machine_id: &str) -> Result<Option<Machine>>;

    // ── Settings ─────────────────────────────────────────────────────────

    /// Current settings, or the defaults if none were ever written.
    fn settings(&self) -> Result<Settings>;

    fn update_settings(&self, settings: &Settings) -> Result<Settings>;
}
