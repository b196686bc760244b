use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    handlers::{
        create_license, delete_license, get_settings, health, license_usage, list_licenses,
        list_machines, register_machine, reset_trial, update_settings, validate_license,
    },
    keygen::{self, KeyGenerator},
    store::RedbStore,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Master key the token-encryption key is derived from. Required.
    pub master_key: String,
    pub data_dir: Option<PathBuf>,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("KEYMINT_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("KEYMINT_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3001),
            master_key: std::env::var("KEYMINT_MASTER_KEY").unwrap_or_default(),
            data_dir: std::env::var("KEYMINT_DATA_DIR").ok().map(PathBuf::from),
            cors_origins: std::env::var("KEYMINT_CORS_ORIGINS").ok(),
        }
    }
}

/// Read a master key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &std::path::Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the master key from `KEYMINT_MASTER_KEY_FILE` (preferred) or
/// `KEYMINT_MASTER_KEY`. File-based delivery is recommended for production —
/// env vars are visible via `docker inspect` and `/proc`.
pub fn resolve_master_key() -> Result<String> {
    if let Ok(path) = std::env::var("KEYMINT_MASTER_KEY_FILE") {
        let key = read_key_file(std::path::Path::new(&path))?;
        if std::env::var("KEYMINT_MASTER_KEY").is_ok() {
            tracing::warn!("both KEYMINT_MASTER_KEY and KEYMINT_MASTER_KEY_FILE are set; using file");
        }
        return Ok(key);
    }
    std::env::var("KEYMINT_MASTER_KEY")
        .context("KEYMINT_MASTER_KEY or KEYMINT_MASTER_KEY_FILE environment variable is required")
}

/// Resolve the data directory, creating it if needed.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    if cfg.master_key.is_empty() {
        anyhow::bail!("master key must not be empty");
    }

    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    // Derive the token-encryption key from the master key and a persisted
    // salt, so issued tokens remain reproducible across restarts.
    let salt = load_or_create_salt(&data_dir)?;
    let enc_key = keygen::derive_key(&cfg.master_key, &salt)?;

    let db_path = data_dir.join("keymint.db");
    let store = RedbStore::open(&db_path).context("open store")?;

    let state = AppState {
        store: Arc::new(store),
        keygen: Arc::new(KeyGenerator::new(enc_key)),
    };

    let cors = build_cors(cfg.cors_origins.as_deref());

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/validate-license", post(validate_license))
        .route("/api/machines/register", post(register_machine))
        .route("/api/machines/{machine_id}/reset-trial", post(reset_trial))
        .route("/api/machines", get(list_machines))
        .route("/api/licenses", get(list_licenses))
        .route("/api/licenses", post(create_license))
        .route("/api/licenses/{id}", delete(delete_license))
        .route("/api/licenses/{id}/usage", get(license_usage))
        .route("/api/settings", get(get_settings))
        .route("/api/settings", post(update_settings))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "keymint server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn load_or_create_salt(data_dir: &std::path::Path) -> Result<[u8; 32]> {
    let salt_path = data_dir.join("keymint.salt");
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read keymint.salt")?;
        let salt: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "keymint.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })?;
        Ok(salt)
    } else {
        let salt = keygen::generate_salt();
        std::fs::write(&salt_path, salt).context("write keymint.salt")?;
        info!("generated new key-derivation salt");
        Ok(salt)
    }
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<http::HeaderValue> =
                o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn salt_is_persisted_across_loads() {
        let dir = tempdir().unwrap();
        let first = load_or_create_salt(dir.path()).unwrap();
        let second = load_or_create_salt(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_salt_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keymint.salt"), b"short").unwrap();
        assert!(load_or_create_salt(dir.path()).is_err());
    }

    #[test]
    fn key_file_is_trimmed_and_must_not_be_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.key");

        std::fs::write(&path, "  secret-key\n").unwrap();
        assert_eq!(read_key_file(&path).unwrap(), "secret-key");

        std::fs::write(&path, "   \n").unwrap();
        assert!(read_key_file(&path).is_err());
    }
}
