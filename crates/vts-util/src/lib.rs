use std::{net::SocketAddr, path::PathBuf, time::Duration};

use tonic::transport::{server::Router, Channel, Endpoint, Server};
use tracing::{debug, info};

pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:50060";
pub const DEFAULT_NODE_ADDR: &str = "127.0.0.1:50061";
pub const DEFAULT_HUB_LISTEN_ADDR: &str = "0.0.0.0:50060";
pub const DEFAULT_NODE_LISTEN_ADDR: &str = "0.0.0.0:50061";

/// Packages are streamed between processes in chunks of this size.
pub const PACKAGE_CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound for a single decoded message; execution results carry whole logs.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

pub fn env_addr(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Reads a numeric variable, falling back to `default` when unset or unparsable.
pub fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(key, default))
}

pub fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_u64(key, default))
}

pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn hub_addr() -> String {
    env_addr("VTS_HUB_ADDR", DEFAULT_HUB_ADDR)
}

pub fn node_addr() -> String {
    env_addr("VTS_NODE_ADDR", DEFAULT_NODE_ADDR)
}

/// Loads a `.env` file from the working directory or its parents, if any.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => debug!("loaded environment from {}", path.display()),
        Err(err) if err.not_found() => {}
        Err(err) => eprintln!("failed to load .env: {err}"),
    }
}

pub fn data_dir() -> PathBuf {
    if let Some(dir) = env_string("VTS_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/vts")
    } else {
        PathBuf::from("/tmp/vts")
    }
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

pub async fn connect_channel(
    addr: &str,
    connect_timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    Endpoint::from_shared(format!("http://{addr}"))?
        .connect_timeout(connect_timeout)
        .connect()
        .await
}

pub async fn serve_grpc<F>(
    app_name: &str,
    addr_env: &str,
    default_addr: &str,
    add_service: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut Server) -> Router,
{
    let addr_str = env_addr(addr_env, default_addr);
    let addr: SocketAddr = addr_str.parse()?;
    info!("{app_name} listening on {addr}");

    let mut server = Server::builder();
    add_service(&mut server).serve(addr).await?;
    Ok(())
}

/// Splits a payload into transfer chunks; an empty payload still yields one chunk.
pub fn split_chunks(data: &[u8]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return vec![Vec::new()];
    }
    data.chunks(PACKAGE_CHUNK_SIZE).map(<[u8]>::to_vec).collect()
}
