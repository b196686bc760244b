use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::model::{License, Machine, Settings, UsageRecord};
use super::port::{BindOutcome, Persistence, UsageInsert};

const LICENSES: TableDefinition<&str, &[u8]> = TableDefinition::new("licenses");
/// Secondary index enforcing key uniqueness: license key -> license id.
const LICENSE_KEYS: TableDefinition<&str, &str> = TableDefinition::new("license_keys");
const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");
/// The one-time-use ledger. The composite key IS the uniqueness constraint.
const LICENSE_USAGE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("license_usage");
const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");
const SETTINGS_KEY: &str = "settings";

/// Thread-safe handle to the redb store. redb serializes writers, which is
/// what makes `bind_if_unset` and `insert_usage_once` atomic.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(LICENSES)?;
        write_txn.open_table(LICENSE_KEYS)?;
        write_txn.open_table(MACHINES)?;
        write_txn.open_table(LICENSE_USAGE)?;
        write_txn.open_table(SETTINGS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).context("bincode encode")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(value)
}

impl Persistence for RedbStore {
    // ── Licenses ─────────────────────────────────────────────────────────

    fn insert_license(&self, license: &License) -> Result<()> {
        let bytes = encode(license)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut keys = write_txn.open_table(LICENSE_KEYS)?;
            if keys.get(license.key.as_str())?.is_some() {
                anyhow::bail!("license key already exists");
            }
            keys.insert(license.key.as_str(), license.id.as_str())?;

            let mut licenses = write_txn.open_table(LICENSES)?;
            licenses.insert(license.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(id = %license.id, "stored license");
        Ok(())
    }

    fn license_by_id(&self, id: &str) -> Result<Option<License>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSES)?;
        let raw: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw.map(|bytes| decode(&bytes)).transpose()
    }

    fn license_by_key(&self, key: &str) -> Result<Option<License>> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(LICENSE_KEYS)?;
        let id: Option<String> = keys.get(key)?.map(|guard| guard.value().to_owned());

        match id {
            None => Ok(None),
            Some(id) => {
                let table = read_txn.open_table(LICENSES)?;
                let raw: Option<Vec<u8>> =
                    table.get(id.as_str())?.map(|guard| guard.value().to_vec());
                raw.map(|bytes| decode(&bytes)).transpose()
            }
        }
    }

    fn list_licenses(&self) -> Result<Vec<License>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSES)?;

        let mut licenses = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            licenses.push(decode::<License>(v.value())?);
        }
        licenses.sort_by_key(|l| std::cmp::Reverse(l.created_at));
        Ok(licenses)
    }

    fn delete_license(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut licenses = write_txn.open_table(LICENSES)?;
            // Clone the old value out so the borrow ends before the index
            // table is touched.
            let old: Option<Vec<u8>> = licenses.remove(id)?.map(|guard| guard.value().to_vec());
            match old {
                None => false,
                Some(bytes) => {
                    let license: License = decode(&bytes)?;
                    let mut keys = write_txn.open_table(LICENSE_KEYS)?;
                    keys.remove(license.key.as_str())?;
                    true
                }
            }
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn bind_if_unset(&self, license_id: &str, machine_id: &str) -> Result<BindOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(LICENSES)?;
            let raw: Option<Vec<u8>> = table.get(license_id)?.map(|guard| guard.value().to_vec());
            let bytes = raw.with_context(|| format!("license {license_id} not found for bind"))?;
            let mut license: License = decode(&bytes)?;

            match license.machine_id {
                Some(bound) => BindOutcome::AlreadyBound(bound),
                None => {
                    license.machine_id = Some(machine_id.to_owned());
                    let updated = encode(&license)?;
                    table.insert(license_id, updated.as_slice())?;
                    BindOutcome::Bound
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn record_license_use(&self, license_id: &str, now: i64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LICENSES)?;
            let raw: Option<Vec<u8>> = table.get(license_id)?.map(|guard| guard.value().to_vec());
            let bytes = raw.with_context(|| format!("license {license_id} not found for use"))?;
            let mut license: License = decode(&bytes)?;

            license.usage_count += 1;
            license.last_used = Some(now);

            let updated = encode(&license)?;
            table.insert(license_id, updated.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ── Usage ledger ─────────────────────────────────────────────────────

    fn insert_usage_once(
        &self,
        license_id: &str,
        machine_id: &str,
        used_at: i64,
    ) -> Result<UsageInsert> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(LICENSE_USAGE)?;
            if table.get((license_id, machine_id))?.is_some() {
                UsageInsert::Duplicate
            } else {
                let record = UsageRecord {
                    license_id: license_id.to_owned(),
                    machine_id: machine_id.to_owned(),
                    used_at,
                };
                let bytes = encode(&record)?;
                table.insert((license_id, machine_id), bytes.as_slice())?;
                UsageInsert::Inserted
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn usage_exists(&self, license_id: &str, machine_id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSE_USAGE)?;
        Ok(table.get((license_id, machine_id))?.is_some())
    }

    fn usage_for_license(&self, license_id: &str) -> Result<Vec<UsageRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSE_USAGE)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (k, v) = item?;
            if k.value().0 == license_id {
                records.push(decode::<UsageRecord>(v.value())?);
            }
        }
        Ok(records)
    }

    // ── Machines ─────────────────────────────────────────────────────────

    fn machine(&self, machine_id: &str) -> Result<Option<Machine>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MACHINES)?;
        let raw: Option<Vec<u8>> = table.get(machine_id)?.map(|guard| guard.value().to_vec());
        raw.map(|bytes| decode(&bytes)).transpose()
    }

    fn list_machines(&self) -> Result<Vec<Machine>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MACHINES)?;

        let mut machines = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            machines.push(decode::<Machine>(v.value())?);
        }
        machines.sort_by_key(|m| std::cmp::Reverse(m.last_seen));
        Ok(machines)
    }

    fn upsert_machine(&self, machine: &Machine) -> Result<()> {
        let bytes = encode(machine)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MACHINES)?;
            table.insert(machine.machine_id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(machine_id = %machine.machine_id, "stored machine");
        Ok(())
    }

    fn touch_machine(&self, machine_id: &str, now: i64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let touched = {
            let mut table = write_txn.open_table(MACHINES)?;
            let raw: Option<Vec<u8>> = table.get(machine_id)?.map(|guard| guard.value().to_vec());
            match raw {
                None => false,
                Some(bytes) => {
                    let mut machine: Machine = decode(&bytes)?;
                    machine.last_seen = now;
                    let updated = encode(&machine)?;
                    table.insert(machine_id, updated.as_slice())?;
                    true
                }
            }
        };
        write_txn.commit()?;
        Ok(touched)
    }

    fn arm_trial_reset(&self, machine_id: &str) -> Result<Option<Machine>> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut machines = write_txn.open_table(MACHINES)?;
            let raw: Option<Vec<u8>> =
                machines.get(machine_id)?.map(|guard| guard.value().to_vec());

            match raw {
                None => None,
                Some(bytes) => {
                    // Deactivate every license bound to this machine in the
                    // same transaction as the machine flip.
                    let mut licenses = write_txn.open_table(LICENSES)?;
                    let bound: Vec<(String, Vec<u8>)> = {
                        let mut out = Vec::new();
                        for item in licenses.iter()? {
                            let (k, v) = item?;
                            out.push((k.value().to_owned(), v.value().to_vec()));
                        }
                        out
                    };
                    for (id, raw_bytes) in &bound {
                        let mut license: License = decode(raw_bytes)?;
                        if license.machine_id.as_deref() == Some(machine_id) && license.is_active {
                            license.is_active = false;
                            let updated = encode(&license)?;
                            licenses.insert(id.as_str(), updated.as_slice())?;
                        }
                    }

                    let mut machine: Machine = decode(&bytes)?;
                    machine.blocked_license_key = machine.license_key.take();
                    machine.needs_trial_reset = true;

                    let updated = encode(&machine)?;
                    machines.insert(machine_id, updated.as_slice())?;
                    Some(machine)
                }
            }
        };
        write_txn.commit()?;
        Ok(updated)
    }

    // ── Settings ─────────────────────────────────────────────────────────

    fn settings(&self) -> Result<Settings> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS)?;
        let raw: Option<Vec<u8>> = table.get(SETTINGS_KEY)?.map(|guard| guard.value().to_vec());
        match raw {
            None => Ok(Settings::default()),
            Some(bytes) => decode(&bytes),
        }
    }

    fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        let bytes = encode(settings)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS)?;
            table.insert(SETTINGS_KEY, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(settings.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (RedbStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = RedbStore::open(&path).unwrap();
        (store, dir)
    }

    fn license(id: &str, key: &str, machine_id: Option<&str>) -> License {
        License {
            id: id.into(),
            key: key.into(),
            expiration_date: i64::MAX,
            machine_id: machine_id.map(Into::into),
            is_active: true,
            usage_count: 0,
            last_used: None,
            created_at: 100,
        }
    }

    fn machine(machine_id: &str, license_key: Option<&str>) -> Machine {
        Machine {
            machine_id: machine_id.into(),
            hostname: "host".into(),
            platform: "linux".into(),
            version: "1.0.0".into(),
            license_key: license_key.map(Into::into),
            needs_trial_reset: false,
            blocked_license_key: None,
            last_seen: 100,
            created_at: 100,
        }
    }

    #[test]
    fn license_round_trip_and_key_lookup() {
        let (s, _dir) = make_store();
        let l = license("l1", "aa:bb", None);
        s.insert_license(&l).unwrap();

        assert_eq!(s.license_by_id("l1").unwrap(), Some(l.clone()));
        assert_eq!(s.license_by_key("aa:bb").unwrap(), Some(l));
        assert_eq!(s.license_by_key("nope").unwrap(), None);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (s, _dir) = make_store();
        s.insert_license(&license("l1", "aa:bb", None)).unwrap();
        assert!(s.insert_license(&license("l2", "aa:bb", None)).is_err());
    }

    #[test]
    fn delete_removes_key_index() {
        let (s, _dir) = make_store();
        s.insert_license(&license("l1", "aa:bb", None)).unwrap();

        assert!(s.delete_license("l1").unwrap());
        assert_eq!(s.license_by_key("aa:bb").unwrap(), None);
        assert!(!s.delete_license("l1").unwrap());
    }

    #[test]
    fn bind_if_unset_binds_once() {
        let (s, _dir) = make_store();
        s.insert_license(&license("l1", "aa:bb", None)).unwrap();

        assert_eq!(s.bind_if_unset("l1", "m1").unwrap(), BindOutcome::Bound);
        assert_eq!(
            s.bind_if_unset("l1", "m2").unwrap(),
            BindOutcome::AlreadyBound("m1".into())
        );
        // Binding is permanent — even the winner only observes the bound id.
        assert_eq!(
            s.bind_if_unset("l1", "m1").unwrap(),
            BindOutcome::AlreadyBound("m1".into())
        );
    }

    #[test]
    fn usage_insert_is_unique_per_pair() {
        let (s, _dir) = make_store();

        assert_eq!(
            s.insert_usage_once("l1", "m1", 5).unwrap(),
            UsageInsert::Inserted
        );
        assert_eq!(
            s.insert_usage_once("l1", "m1", 6).unwrap(),
            UsageInsert::Duplicate
        );
        assert_eq!(
            s.insert_usage_once("l1", "m2", 7).unwrap(),
            UsageInsert::Inserted
        );

        assert!(s.usage_exists("l1", "m1").unwrap());
        assert!(!s.usage_exists("l2", "m1").unwrap());

        let records = s.usage_for_license("l1").unwrap();
        assert_eq!(records.len(), 2);
        // The first insert's timestamp survived the duplicate attempt.
        assert!(records
            .iter()
            .any(|r| r.machine_id == "m1" && r.used_at == 5));
    }

    #[test]
    fn record_license_use_bumps_counters() {
        let (s, _dir) = make_store();
        s.insert_license(&license("l1", "aa:bb", None)).unwrap();

        s.record_license_use("l1", 42).unwrap();
        s.record_license_use("l1", 43).unwrap();

        let l = s.license_by_id("l1").unwrap().unwrap();
        assert_eq!(l.usage_count, 2);
        assert_eq!(l.last_used, Some(43));
    }

    #[test]
    fn touch_machine_never_creates() {
        let (s, _dir) = make_store();
        assert!(!s.touch_machine("ghost", 1).unwrap());
        assert_eq!(s.machine("ghost").unwrap(), None);

        s.upsert_machine(&machine("m1", None)).unwrap();
        assert!(s.touch_machine("m1", 999).unwrap());
        assert_eq!(s.machine("m1").unwrap().unwrap().last_seen, 999);
    }

    #[test]
    fn arm_trial_reset_flips_machine_and_deactivates_licenses() {
        let (s, _dir) = make_store();
        s.insert_license(&license("l1", "k1:x", Some("m1"))).unwrap();
        s.insert_license(&license("l2", "k2:x", Some("m2"))).unwrap();
        s.upsert_machine(&machine("m1", Some("k1:x"))).unwrap();

        let m = s.arm_trial_reset("m1").unwrap().unwrap();
        assert!(m.needs_trial_reset);
        assert_eq!(m.license_key, None);
        assert_eq!(m.blocked_license_key, Some("k1:x".into()));

        assert!(!s.license_by_id("l1").unwrap().unwrap().is_active);
        // Licenses bound elsewhere are untouched.
        assert!(s.license_by_id("l2").unwrap().unwrap().is_active);
    }

    #[test]
    fn arm_trial_reset_unknown_machine_is_a_no_op() {
        let (s, _dir) = make_store();
        s.insert_license(&license("l1", "k1:x", Some("m1"))).unwrap();

        assert_eq!(s.arm_trial_reset("m1").unwrap(), None);
        assert!(s.license_by_id("l1").unwrap().unwrap().is_active);
    }

    #[test]
    fn settings_default_then_update() {
        let (s, _dir) = make_store();
        assert_eq!(s.settings().unwrap(), Settings::default());

        let updated = s
            .update_settings(&Settings {
                trial_duration: 14,
                max_machines: 3,
            })
            .unwrap();
        assert_eq!(updated.trial_duration, 14);
        assert_eq!(s.settings().unwrap(), updated);
    }

    #[test]
    fn listings_are_sorted() {
        let (s, _dir) = make_store();
        let mut a = license("a", "ka:x", None);
        a.created_at = 1;
        let mut b = license("b", "kb:x", None);
        b.created_at = 2;
        s.insert_license(&a).unwrap();
        s.insert_license(&b).unwrap();
        let ids: Vec<_> = s
            .list_licenses()
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);

        let mut m1 = machine("m1", None);
        m1.last_seen = 10;
        let mut m2 = machine("m2", None);
        m2.last_seen = 20;
        s.upsert_machine(&m1).unwrap();
        s.upsert_machine(&m2).unwrap();
        let ids: Vec<_> = s
            .list_machines()
            .unwrap()
            .into_iter()
            .map(|m| m.machine_id)
            .collect();
        assert_eq!(ids, vec!["m2".to_string(), "m1".to_string()]);
    }
}
