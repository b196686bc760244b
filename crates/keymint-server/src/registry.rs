//! Machine registration and heartbeat, including the trial-reset evasion
//! state machine.
//!
//! A machine is either Normal or PendingReset (`needs_trial_reset = true`).
//! While pending, the one key that was bound at reset time
//! (`blocked_license_key`) is silently stripped if the client replays it —
//! the typical evasion move is resending a cached key after a local wipe.
//! Any *different* non-null key clears the pending state, so an operator can
//! forgive a machine by issuing it a genuinely new license. Key-less
//! heartbeats always go through; liveness reporting is never blocked.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{debug, info};

use crate::store::{Machine, Persistence};

/// One registration or heartbeat request.
///
/// `license_key` is a double option because the wire distinguishes three
/// cases: field absent (`None` — keep the stored key), explicit null
/// (`Some(None)` — clear it), and a value (`Some(Some(k))`).
#[derive(Debug, Clone)]
pub struct Registration {
    pub machine_id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub license_key: Option<Option<String>>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Register a new machine or refresh an existing one, applying the
/// PendingReset transition table. Returns the stored snapshot — identical in
/// shape whether or not a replayed key was stripped, so the response carries
/// no diagnostic an evading client could script against.
pub fn register_or_heartbeat(store: &dyn Persistence, reg: Registration) -> Result<Machine> {
    let now = now();

    let machine = match store.machine(&reg.machine_id)? {
        None => {
            let machine = Machine {
                machine_id: reg.machine_id.clone(),
                hostname: reg.hostname,
                platform: reg.platform,
                version: reg.version,
                license_key: reg.license_key.flatten(),
                needs_trial_reset: false,
                blocked_license_key: None,
                last_seen: now,
                created_at: now,
            };
            info!(machine_id = %machine.machine_id, "registered new machine");
            machine
        }
        Some(mut machine) => {
            machine.hostname = reg.hostname;
            machine.platform = reg.platform;
            machine.version = reg.version;
            machine.last_seen = now;

            if machine.needs_trial_reset {
                match reg.license_key {
                    Some(Some(key)) if machine.blocked_license_key.as_deref() != Some(key.as_str()) => {
                        // A genuinely different license — leave PendingReset.
                        info!(machine_id = %machine.machine_id, "pending reset cleared by new license");
                        machine.license_key = Some(key);
                        machine.blocked_license_key = None;
                        machine.needs_trial_reset = false;
                    }
                    Some(_) => {
                        // Replay of the blocked key (or null against a trial
                        // machine): strip it and stay pending.
                        debug!(machine_id = %machine.machine_id, "stripped replayed key while pending reset");
                        machine.license_key = None;
                    }
                    None => {
                        machine.license_key = None;
                    }
                }
            } else {
                match reg.license_key {
                    None => {}
                    Some(key) => machine.license_key = key,
                }
            }
            machine
        }
    };

    store.upsert_machine(&machine)?;
    Ok(machine)
}
