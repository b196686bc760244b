//! Admin-triggered trial reset.
//!
//! Revokes a machine's current license association and arms the anti-replay
//! block that `registry` enforces. The storage effects — deactivating every
//! license bound to the machine, moving the bound key into
//! `blocked_license_key`, nulling the key, raising `needs_trial_reset` —
//! happen in one port transaction (`arm_trial_reset`).

use anyhow::Result;
use tracing::info;

use crate::store::{Machine, Persistence};

/// Reset the trial state of `machine_id`. Idempotent: a second reset leaves
/// the machine pending with whatever key was bound at the latest reset.
/// Returns `None` for an unknown machine.
pub fn reset_trial(store: &dyn Persistence, machine_id: &str) -> Result<Option<Machine>> {
    let updated = store.arm_trial_reset(machine_id)?;
    if let Some(ref machine) = updated {
        info!(
            machine_id,
            had_license = machine.blocked_license_key.is_some(),
            "trial reset armed"
        );
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{register_or_heartbeat, Registration};
    use crate::store::{License, RedbStore};
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = RedbStore::open(&path).unwrap();
        (store, dir)
    }

    fn register(store: &RedbStore, machine_id: &str, license_key: Option<&str>) {
        register_or_heartbeat(
            store,
            Registration {
                machine_id: machine_id.into(),
                hostname: "host".into(),
                platform: "linux".into(),
                version: "1.0.0".into(),
                license_key: license_key.map(|k| Some(k.into())),
            },
        )
        .unwrap();
    }

    #[test]
    fn reset_moves_the_bound_key_into_the_block_slot() {
        let (s, _dir) = make_store();
        register(&s, "m1", Some("K1"));

        let m = reset_trial(&s, "m1").unwrap().unwrap();
        assert!(m.needs_trial_reset);
        assert_eq!(m.license_key, None);
        assert_eq!(m.blocked_license_key.as_deref(), Some("K1"));
    }

    #[test]
    fn reset_deactivates_licenses_bound_to_the_machine() {
        let (s, _dir) = make_store();
        register(&s, "m1", Some("K1"));
        s.insert_license(&License {
            id: "l1".into(),
            key: "K1".into(),
            expiration_date: i64::MAX,
            machine_id: Some("m1".into()),
            is_active: true,
            usage_count: 1,
            last_used: Some(10),
            created_at: 0,
        })
        .unwrap();

        reset_trial(&s, "m1").unwrap();
        assert!(!s.license_by_id("l1").unwrap().unwrap().is_active);
    }

    #[test]
    fn double_reset_is_idempotent() {
        let (s, _dir) = make_store();
        register(&s, "m1", Some("K1"));

        reset_trial(&s, "m1").unwrap();
        let m = reset_trial(&s, "m1").unwrap().unwrap();

        // The second reset sees a null bound key, which is what was current.
        assert!(m.needs_trial_reset);
        assert_eq!(m.license_key, None);
        assert_eq!(m.blocked_license_key, None);
    }

    #[test]
    fn reset_of_unknown_machine_reports_none() {
        let (s, _dir) = make_store();
        assert_eq!(reset_trial(&s, "ghost").unwrap(), None);
    }
}
