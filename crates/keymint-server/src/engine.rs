//! The key-check protocol: lookup, expiry, machine binding, one-time use.
//!
//! Every call is one short request/response pass over the persistence port;
//! no state is held between calls. Race safety rests entirely on the port's
//! two primitives: `bind_if_unset` resolves concurrent first binds to one
//! winner, and `insert_usage_once` turns a concurrent duplicate into the
//! ordinary `already_used` outcome.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{debug, info};

use crate::store::{BindOutcome, License, Persistence, UsageInsert};

/// Reserved `licenseKey` value for the reset-probe protocol: a client polls
/// with this instead of a real key to ask "has my trial been reset?".
/// Recognized by exact match only, and never collides with an issued token
/// (tokens always contain a `:`).
pub const TRIAL_RESET_PROBE: &str = "check_trial_reset";

/// The result of checking a license key.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Key accepted. Carries the post-validation license snapshot.
    Valid(License),
    /// Key rejected for a protocol reason. An expected outcome, not an
    /// error — storage faults surface as `Err` instead.
    Invalid(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Unknown key — also the generic negative for the probe path.
    KeyNotFound,
    Expired,
    /// Deactivated by a trial reset.
    Revoked,
    /// Bound to a different machine.
    UnauthorizedMachine,
    /// The (license, machine) pair has already validated once.
    AlreadyUsed,
    /// Probe response: the machine must discard its cached license state.
    ResetTrial,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyNotFound => "key_not_found",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::UnauthorizedMachine => "unauthorized_machine",
            Self::AlreadyUsed => "already_used",
            Self::ResetTrial => "reset_trial",
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Validate `license_key` for `machine_id`.
///
/// Callers must have checked that both arguments are non-empty; that is a
/// request-shape concern, handled at the HTTP boundary.
///
/// A machine may successfully validate a given license exactly once for its
/// entire lifetime — this is a single-activation model. The first success on
/// an unbound license also binds it permanently.
pub fn validate(store: &dyn Persistence, license_key: &str, machine_id: &str) -> Result<Validation> {
    if license_key == TRIAL_RESET_PROBE {
        return probe_trial_reset(store, machine_id);
    }

    let Some(mut license) = store.license_by_key(license_key)? else {
        debug!(machine_id, "validation failed: unknown key");
        return Ok(Validation::Invalid(RejectReason::KeyNotFound));
    };

    let now = now();
    if license.is_expired(now) {
        debug!(license_id = %license.id, "validation failed: expired");
        return Ok(Validation::Invalid(RejectReason::Expired));
    }
    if !license.is_active {
        debug!(license_id = %license.id, "validation failed: revoked");
        return Ok(Validation::Invalid(RejectReason::Revoked));
    }

    if let Some(ref bound) = license.machine_id {
        if bound != machine_id {
            debug!(license_id = %license.id, machine_id, "validation failed: bound elsewhere");
            return Ok(Validation::Invalid(RejectReason::UnauthorizedMachine));
        }
    }

    if store.usage_exists(&license.id, machine_id)? {
        debug!(license_id = %license.id, machine_id, "validation failed: already used");
        return Ok(Validation::Invalid(RejectReason::AlreadyUsed));
    }

    if license.machine_id.is_none() {
        match store.bind_if_unset(&license.id, machine_id)? {
            BindOutcome::Bound => {
                info!(license_id = %license.id, machine_id, "license bound");
            }
            BindOutcome::AlreadyBound(winner) if winner == machine_id => {
                // A concurrent request from this same machine won the bind;
                // the usage insert below decides which request succeeds.
            }
            BindOutcome::AlreadyBound(winner) => {
                debug!(license_id = %license.id, machine_id, winner = %winner, "lost bind race");
                return Ok(Validation::Invalid(RejectReason::UnauthorizedMachine));
            }
        }
    }

    match store.insert_usage_once(&license.id, machine_id, now)? {
        UsageInsert::Inserted => {}
        UsageInsert::Duplicate => {
            debug!(license_id = %license.id, machine_id, "concurrent duplicate use");
            return Ok(Validation::Invalid(RejectReason::AlreadyUsed));
        }
    }

    store.record_license_use(&license.id, now)?;

    // Heartbeat side effect only — validation never creates machine rows.
    store.touch_machine(machine_id, now)?;

    info!(license_id = %license.id, machine_id, "license validated");

    license.machine_id = Some(machine_id.to_owned());
    license.usage_count += 1;
    license.last_used = Some(now);
    Ok(Validation::Valid(license))
}

/// The sentinel path: no key lookup at all. Reports `ResetTrial` only for a
/// machine that is pending reset; everything else gets the same generic
/// negative as an unknown key, so the probe leaks nothing to a scripted
/// client.
fn probe_trial_reset(store: &dyn Persistence, machine_id: &str) -> Result<Validation> {
    match store.machine(machine_id)? {
        Some(machine) if machine.needs_trial_reset => {
            store.touch_machine(machine_id, now())?;
            info!(machine_id, "trial reset delivered to probing machine");
            Ok(Validation::Invalid(RejectReason::ResetTrial))
        }
        _ => Ok(Validation::Invalid(RejectReason::KeyNotFound)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Machine, RedbStore};
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = RedbStore::open(&path).unwrap();
        (store, dir)
    }

    fn license(key: &str, machine_id: Option<&str>) -> License {
        License {
            id: format!("id-{key}"),
            key: key.into(),
            expiration_date: i64::MAX,
            machine_id: machine_id.map(Into::into),
            is_active: true,
            usage_count: 0,
            last_used: None,
            created_at: 0,
        }
    }

    fn insert_license(store: &RedbStore, key: &str, machine_id: Option<&str>) -> License {
        let license = license(key, machine_id);
        store.insert_license(&license).unwrap();
        license
    }

    fn insert_machine(store: &RedbStore, machine_id: &str, needs_trial_reset: bool) {
        store
            .upsert_machine(&Machine {
                machine_id: machine_id.into(),
                hostname: "host".into(),
                platform: "linux".into(),
                version: "1.0.0".into(),
                license_key: None,
                needs_trial_reset,
                blocked_license_key: None,
                last_seen: 1,
                created_at: 1,
            })
            .unwrap();
    }

    fn reason(v: Validation) -> RejectReason {
        match v {
            Validation::Invalid(r) => r,
            Validation::Valid(l) => panic!("expected rejection, got valid license {}", l.id),
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        let (s, _dir) = make_store();
        let v = validate(&s, "aa:bb", "m1").unwrap();
        assert_eq!(reason(v), RejectReason::KeyNotFound);
    }

    #[test]
    fn expired_license_is_rejected() {
        let (s, _dir) = make_store();
        let mut l = license("k:expired", None);
        l.expiration_date = 1_000; // long past
        s.insert_license(&l).unwrap();

        let v = validate(&s, "k:expired", "m1").unwrap();
        assert_eq!(reason(v), RejectReason::Expired);
    }

    #[test]
    fn revoked_license_is_rejected() {
        let (s, _dir) = make_store();
        let mut l = license("k:revoked", None);
        l.is_active = false;
        s.insert_license(&l).unwrap();

        let v = validate(&s, "k:revoked", "m1").unwrap();
        assert_eq!(reason(v), RejectReason::Revoked);
    }

    #[test]
    fn unbound_license_binds_then_enforces_one_use_per_machine() {
        // Scenario: create with no machine, validate twice from m1, then m2.
        let (s, _dir) = make_store();
        insert_license(&s, "k:a", None);

        let first = validate(&s, "k:a", "m1").unwrap();
        match first {
            Validation::Valid(l) => {
                assert_eq!(l.machine_id.as_deref(), Some("m1"));
                assert_eq!(l.usage_count, 1);
                assert!(l.last_used.is_some());
            }
            other => panic!("expected valid, got {other:?}"),
        }

        // Even the bound machine only ever validates once.
        let second = validate(&s, "k:a", "m1").unwrap();
        assert_eq!(reason(second), RejectReason::AlreadyUsed);

        let third = validate(&s, "k:a", "m2").unwrap();
        assert_eq!(reason(third), RejectReason::UnauthorizedMachine);
    }

    #[test]
    fn pre_bound_license_rejects_foreign_machine_immediately() {
        let (s, _dir) = make_store();
        insert_license(&s, "k:b", Some("m1"));

        let v = validate(&s, "k:b", "m2").unwrap();
        assert_eq!(reason(v), RejectReason::UnauthorizedMachine);

        // The rightful machine still validates.
        let v = validate(&s, "k:b", "m1").unwrap();
        assert!(matches!(v, Validation::Valid(_)));
    }

    #[test]
    fn binding_outlives_the_single_use() {
        let (s, _dir) = make_store();
        let l = insert_license(&s, "k:c", None);

        validate(&s, "k:c", "m1").unwrap();
        // Permanent: the stored license stays bound to m1 forever.
        let stored = s.license_by_id(&l.id).unwrap().unwrap();
        assert_eq!(stored.machine_id.as_deref(), Some("m1"));

        for _ in 0..3 {
            let v = validate(&s, "k:c", "m2").unwrap();
            assert_eq!(reason(v), RejectReason::UnauthorizedMachine);
        }
    }

    #[test]
    fn validation_touches_existing_machine_but_never_creates_one() {
        let (s, _dir) = make_store();
        insert_license(&s, "k:d", None);
        insert_machine(&s, "m1", false);

        validate(&s, "k:d", "m1").unwrap();
        assert!(s.machine("m1").unwrap().unwrap().last_seen > 1);

        insert_license(&s, "k:e", None);
        validate(&s, "k:e", "m-unregistered").unwrap();
        assert!(s.machine("m-unregistered").unwrap().is_none());
    }

    #[test]
    fn concurrent_first_validations_have_exactly_one_winner() {
        let (s, _dir) = make_store();
        insert_license(&s, "k:race", None);

        let results: Vec<Validation> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = s.clone();
                    let machine = format!("m{i}");
                    scope.spawn(move || validate(&store, "k:race", &machine).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results
            .iter()
            .filter(|v| matches!(v, Validation::Valid(_)))
            .count();
        assert_eq!(winners, 1);
        for v in results {
            if let Validation::Invalid(r) = v {
                assert_eq!(r, RejectReason::UnauthorizedMachine);
            }
        }
    }

    #[test]
    fn concurrent_same_machine_validations_collapse_to_already_used() {
        let (s, _dir) = make_store();
        insert_license(&s, "k:same", None);

        let results: Vec<Validation> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = s.clone();
                    scope.spawn(move || validate(&store, "k:same", "m1").unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners = results
            .iter()
            .filter(|v| matches!(v, Validation::Valid(_)))
            .count();
        assert_eq!(winners, 1);
        for v in results {
            if let Validation::Invalid(r) = v {
                assert_eq!(r, RejectReason::AlreadyUsed);
            }
        }
    }

    #[test]
    fn probe_reports_reset_only_for_pending_machines() {
        let (s, _dir) = make_store();
        insert_machine(&s, "m-pending", true);
        insert_machine(&s, "m-normal", false);

        let v = validate(&s, TRIAL_RESET_PROBE, "m-pending").unwrap();
        assert_eq!(reason(v), RejectReason::ResetTrial);
        // The probe counts as liveness.
        assert!(s.machine("m-pending").unwrap().unwrap().last_seen > 1);

        let v = validate(&s, TRIAL_RESET_PROBE, "m-normal").unwrap();
        assert_eq!(reason(v), RejectReason::KeyNotFound);
        assert_eq!(s.machine("m-normal").unwrap().unwrap().last_seen, 1);

        let v = validate(&s, TRIAL_RESET_PROBE, "m-unknown").unwrap();
        assert_eq!(reason(v), RejectReason::KeyNotFound);
    }

    #[test]
    fn probe_never_consumes_a_usage_slot() {
        let (s, _dir) = make_store();
        let l = insert_license(&s, "k:f", None);
        insert_machine(&s, "m1", true);

        validate(&s, TRIAL_RESET_PROBE, "m1").unwrap();
        assert!(!s.usage_exists(&l.id, "m1").unwrap());
        assert_eq!(s.license_by_id(&l.id).unwrap().unwrap().usage_count, 0);
    }
}
