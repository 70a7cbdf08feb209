mod adb;
mod config;
mod device;
mod ids;
mod logcat;
mod packages;
mod pipeline;
mod registry;
mod service;
mod tool;

use std::sync::Arc;

use tracing::{info, warn};
use vts_proto::vts::v1::node_service_server::NodeServiceServer;
use vts_util::{init_tracing, load_dotenv, serve_grpc, DEFAULT_NODE_LISTEN_ADDR, MAX_MESSAGE_BYTES};

use adb::{Adb, AdbBridge};
use config::NodeConfig;
use packages::PackageStore;
use registry::Registry;
use service::Svc;
use tool::DeviceBridge;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    init_tracing()?;

    let config = NodeConfig::from_env();
    info!(adb = %config.adb_path.display(), data_dir = %config.data_dir.display(), "node config loaded");

    let bridge: Arc<dyn DeviceBridge> = Arc::new(AdbBridge::new(Adb::new(&config)));
    let registry = Arc::new(Registry::new(Arc::clone(&bridge), config.lock_wait));
    match registry.discover().await {
        Ok(devices) => info!(count = devices.len(), "initial discovery finished"),
        Err(err) => warn!("initial discovery failed: {err}"),
    }

    let packages = Arc::new(PackageStore::new(config.packages_dir()));
    let svc = Svc::new(registry, bridge, packages, config);

    serve_grpc(
        "vts-node",
        "VTS_NODE_LISTEN_ADDR",
        DEFAULT_NODE_LISTEN_ADDR,
        |server| {
            server.add_service(
                NodeServiceServer::new(svc)
                    .max_decoding_message_size(MAX_MESSAGE_BYTES)
                    .max_encoding_message_size(MAX_MESSAGE_BYTES),
            )
        },
    )
    .await
}
