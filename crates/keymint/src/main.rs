use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "keymint", about = "Keymint — license key server & admin CLI", version)]
struct Cli {
    /// Keymint server URL (default: http://localhost:3001 or $KEYMINT_SERVER)
    #[arg(long, env = "KEYMINT_SERVER", default_value = "http://localhost:3001")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Keymint HTTP server
    Serve {
        /// Port to listen on (default: $KEYMINT_PORT or 3001)
        #[arg(long, env = "KEYMINT_PORT", default_value = "3001")]
        port: u16,
        /// Host to bind (default: $KEYMINT_HOST or 0.0.0.0)
        #[arg(long, env = "KEYMINT_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Issue a new license
    CreateLicense {
        /// Validity duration e.g. 30d, 1y
        #[arg(long, default_value = "365d")]
        ttl: String,
        /// Pre-bind the license to a machine id
        #[arg(long)]
        machine: Option<String>,
    },
    /// List all licenses
    Licenses,
    /// Delete a license by id
    DeleteLicense {
        /// License id
        id: String,
    },
    /// Show which machines have used a license
    Usage {
        /// License id
        id: String,
    },
    /// List all registered machines
    Machines,
    /// Revoke a machine's license and arm the trial-reset block
    ResetTrial {
        /// Machine id
        machine_id: String,
    },
    /// Check a license key against the server, as a client would
    Validate {
        /// License key
        key: String,
        /// Machine id
        machine_id: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KEYMINT_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::CreateLicense { ttl, machine } => {
            cmd_create_license(&cli.server, &ttl, machine.as_deref()).await
        }
        Commands::Licenses => cmd_licenses(&cli.server).await,
        Commands::DeleteLicense { id } => cmd_delete_license(&cli.server, &id).await,
        Commands::Usage { id } => cmd_usage(&cli.server, &id).await,
        Commands::Machines => cmd_machines(&cli.server).await,
        Commands::ResetTrial { machine_id } => cmd_reset_trial(&cli.server, &machine_id).await,
        Commands::Validate { key, machine_id } => {
            cmd_validate(&cli.server, &key, &machine_id).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let master_key = keymint_server::resolve_master_key()?;

    let cfg = keymint_server::ServerConfig {
        host,
        port,
        master_key,
        ..Default::default()
    };

    keymint_server::run(cfg).await
}

async fn cmd_create_license(server: &str, ttl: &str, machine: Option<&str>) -> Result<()> {
    let ttl_seconds = parse_duration(ttl)?;
    let expiration_date = unix_now() + ttl_seconds as i64;

    let body = serde_json::json!({
        "expirationDate": expiration_date,
        "machineId": machine,
    });

    let json = post_json(server, "/api/licenses", &body).await?;
    let license = &json["license"];
    println!("{}", license["key"].as_str().unwrap_or(""));
    println!("  id: {}", license["id"].as_str().unwrap_or(""));
    match machine {
        Some(m) => println!("  bound to: {m}"),
        None => println!("  unbound (first validation binds)"),
    }
    println!("  expires in {}", format_duration(ttl_seconds as i64));
    Ok(())
}

async fn cmd_licenses(server: &str) -> Result<()> {
    let json = get_json(server, "/api/licenses").await?;
    let licenses: Vec<LicenseItem> =
        serde_json::from_value(json["licenses"].clone()).context("parse licenses list")?;

    if licenses.is_empty() {
        println!("(no licenses)");
        return Ok(());
    }
    for l in &licenses {
        let status = if !l.is_active {
            "revoked".to_string()
        } else {
            let secs_left = l.expiration_date - unix_now();
            if secs_left > 0 {
                format!("expires in {}", format_duration(secs_left))
            } else {
                "expired".to_string()
            }
        };
        let binding = match &l.machine_id {
            Some(m) => format!("bound to {m}"),
            None => "unbound".to_string(),
        };
        println!(
            "  {} — {} — {} — {} use(s)",
            l.id, status, binding, l.usage_count
        );
    }
    Ok(())
}

async fn cmd_delete_license(server: &str, id: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .delete(format!("{}/api/licenses/{}", server.trim_end_matches('/'), id))
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status().is_success() {
        println!("✓ deleted {id}");
    } else {
        let status = resp.status();
        let json: Value = resp.json().await.unwrap_or_default();
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_usage(server: &str, id: &str) -> Result<()> {
    let json = get_json(server, &format!("/api/licenses/{id}/usage")).await?;
    let usage = json["usage"].as_array().cloned().unwrap_or_default();

    if usage.is_empty() {
        println!("(never used)");
        return Ok(());
    }
    for u in &usage {
        println!(
            "  {} — used at {}",
            u["machine_id"].as_str().unwrap_or(""),
            u["used_at"].as_i64().unwrap_or(0)
        );
    }
    Ok(())
}

async fn cmd_machines(server: &str) -> Result<()> {
    let json = get_json(server, "/api/machines").await?;
    let machines: Vec<MachineItem> =
        serde_json::from_value(json["machines"].clone()).context("parse machines list")?;

    if machines.is_empty() {
        println!("(no machines)");
        return Ok(());
    }
    for m in &machines {
        let status = if m.needs_trial_reset {
            "reset pending"
        } else if m.license_key.is_some() {
            "licensed"
        } else {
            "trial"
        };
        let seen_secs_ago = (unix_now() - m.last_seen).max(0);
        println!(
            "  {} — {} ({}) — {} — seen {} ago",
            m.machine_id,
            m.hostname,
            m.platform,
            status,
            format_duration(seen_secs_ago)
        );
    }
    Ok(())
}

async fn cmd_reset_trial(server: &str, machine_id: &str) -> Result<()> {
    let client = Client::new();
    let resp = client
        .post(format!(
            "{}/api/machines/{}/reset-trial",
            server.trim_end_matches('/'),
            machine_id
        ))
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status().is_success() {
        println!("✓ trial reset armed for {machine_id}");
    } else {
        let status = resp.status();
        let json: Value = resp.json().await.unwrap_or_default();
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_validate(server: &str, key: &str, machine_id: &str) -> Result<()> {
    let body = serde_json::json!({
        "licenseKey": key,
        "machineId": machine_id,
    });
    let json = post_json(server, "/api/validate-license", &body).await?;

    if json["valid"].as_bool().unwrap_or(false) {
        println!("✓ valid");
    } else {
        println!("✗ invalid: {}", json["error"].as_str().unwrap_or("unknown"));
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn get_json(server: &str, path: &str) -> Result<Value> {
    let client = Client::new();
    let resp = client
        .get(format!("{}{}", server.trim_end_matches('/'), path))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(json)
}

async fn post_json(server: &str, path: &str, body: &Value) -> Result<Value> {
    let client = Client::new();
    let resp = client
        .post(format!("{}{}", server.trim_end_matches('/'), path))
        .json(body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(json)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Parse human duration strings like "30d", "1y", "12h" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

fn format_duration(secs: i64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[derive(serde::Deserialize)]
struct LicenseItem {
    id: String,
    expiration_date: i64,
    machine_id: Option<String>,
    is_active: bool,
    usage_count: u32,
}

#[derive(serde::Deserialize)]
struct MachineItem {
    machine_id: String,
    hostname: String,
    platform: String,
    license_key: Option<String>,
    needs_trial_reset: bool,
    last_seen: i64,
}
