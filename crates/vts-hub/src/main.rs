mod agents;
mod config;
mod coordinator;
mod directory;
mod packaging;
mod service;

use std::sync::Arc;

use tracing::info;
use vts_proto::vts::v1::hub_service_server::HubServiceServer;
use vts_util::{init_tracing, load_dotenv, serve_grpc, DEFAULT_HUB_LISTEN_ADDR, MAX_MESSAGE_BYTES};

use agents::{AgentClient, GrpcAgent};
use config::HubConfig;
use coordinator::Coordinator;
use directory::{spawn_discovery, Directory};
use packaging::ApkTools;
use service::Svc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    init_tracing()?;

    let config = HubConfig::from_env()?;
    for agent in &config.agents {
        info!(agent = %agent.name, addr = %agent.addr, "host agent configured");
    }

    let agents: Vec<Arc<dyn AgentClient>> = config
        .agents
        .iter()
        .map(|endpoint| {
            Arc::new(GrpcAgent::new(endpoint.clone(), config.connect_timeout)) as Arc<dyn AgentClient>
        })
        .collect();
    let directory = Arc::new(Directory::new(agents));
    spawn_discovery(Arc::clone(&directory), config.discovery_interval);

    let coordinator = Arc::new(Coordinator::new(
        directory,
        Arc::new(ApkTools::new(config.packaging.clone())),
        config.lock_wait,
        config.max_execution,
    ));
    let svc = Svc::new(coordinator);

    serve_grpc("vts-hub", "VTS_HUB_LISTEN_ADDR", DEFAULT_HUB_LISTEN_ADDR, |server| {
        server.add_service(
            HubServiceServer::new(svc)
                .max_decoding_message_size(MAX_MESSAGE_BYTES)
                .max_encoding_message_size(MAX_MESSAGE_BYTES),
        )
    })
    .await
}
