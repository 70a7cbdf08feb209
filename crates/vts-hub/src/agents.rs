//! Host agent clients as seen from the hub.

use std::{sync::Arc, time::Duration};

use tonic::{transport::Channel, Code, Status};
use tracing::debug;
use vts_proto::vts::v1::{
    node_service_client::NodeServiceClient, AcquireDeviceRequest, Device, DiscardPackageRequest,
    ExecutePipelineRequest, ExecutionResult, ListDevicesRequest, ReleaseDeviceRequest,
    UploadPackageChunk,
};
use vts_util::{connect_channel, split_chunks, MAX_MESSAGE_BYTES};

use crate::config::AgentEndpoint;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum AgentError {
    #[error("agent {agent} unreachable: {detail}")]
    Unreachable { agent: String, detail: String },
    #[error("{0}")]
    LockConflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Rejected(String),
}

impl AgentError {
    fn from_status(agent: &str, status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
                AgentError::Unreachable {
                    agent: agent.to_string(),
                    detail: if message.is_empty() {
                        format!("{:?}", status.code())
                    } else {
                        message
                    },
                }
            }
            Code::Aborted => AgentError::LockConflict(message),
            Code::NotFound => AgentError::NotFound(message),
            _ => AgentError::Rejected(message),
        }
    }
}

/// The node operations the hub drives.
#[tonic::async_trait]
pub(crate) trait AgentClient: Send + Sync {
    fn name(&self) -> &str;

    async fn list_devices(&self, request: ListDevicesRequest) -> Result<Vec<Device>, AgentError>;

    async fn acquire(&self, device_id: &str, owner: &str, wait: Duration) -> Result<(), AgentError>;

    async fn release(&self, device_id: &str, owner: &str) -> Result<(), AgentError>;

    /// Stores the package on the agent and returns its reference there.
    async fn upload(&self, file_name: &str, data: Arc<Vec<u8>>) -> Result<String, AgentError>;

    async fn discard(&self, package_ref: &str) -> Result<(), AgentError>;

    async fn execute(&self, request: ExecutePipelineRequest) -> Result<ExecutionResult, AgentError>;
}

pub(crate) struct GrpcAgent {
    endpoint: AgentEndpoint,
    connect_timeout: Duration,
}

impl GrpcAgent {
    pub(crate) fn new(endpoint: AgentEndpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }

    async fn connect(&self) -> Result<NodeServiceClient<Channel>, AgentError> {
        let channel = connect_channel(&self.endpoint.addr, self.connect_timeout)
            .await
            .map_err(|e| AgentError::Unreachable {
                agent: self.endpoint.name.clone(),
                detail: format!("{} ({})", e, self.endpoint.addr),
            })?;
        Ok(NodeServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES))
    }

    fn status(&self, status: Status) -> AgentError {
        AgentError::from_status(&self.endpoint.name, status)
    }
}

#[tonic::async_trait]
impl AgentClient for GrpcAgent {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn list_devices(&self, request: ListDevicesRequest) -> Result<Vec<Device>, AgentError> {
        let mut client = self.connect().await?;
        let resp = client
            .list_devices(request)
            .await
            .map_err(|s| self.status(s))?;
        Ok(resp.into_inner().devices)
    }

    async fn acquire(&self, device_id: &str, owner: &str, wait: Duration) -> Result<(), AgentError> {
        let mut client = self.connect().await?;
        client
            .acquire_device(AcquireDeviceRequest {
                device_id: device_id.to_string(),
                owner_token: owner.to_string(),
                wait_millis: u32::try_from(wait.as_millis()).unwrap_or(u32::MAX),
            })
            .await
            .map_err(|s| self.status(s))?;
        Ok(())
    }

    async fn release(&self, device_id: &str, owner: &str) -> Result<(), AgentError> {
        let mut client = self.connect().await?;
        client
            .release_device(ReleaseDeviceRequest {
                device_id: device_id.to_string(),
                owner_token: owner.to_string(),
            })
            .await
            .map_err(|s| self.status(s))?;
        Ok(())
    }

    async fn upload(&self, file_name: &str, data: Arc<Vec<u8>>) -> Result<String, AgentError> {
        let mut client = self.connect().await?;
        let chunks: Vec<UploadPackageChunk> = split_chunks(&data)
            .into_iter()
            .enumerate()
            .map(|(index, data)| UploadPackageChunk {
                file_name: if index == 0 {
                    file_name.to_string()
                } else {
                    String::new()
                },
                data,
            })
            .collect();
        debug!(agent = %self.endpoint.name, chunks = chunks.len(), "uploading package");
        let resp = client
            .upload_package(tokio_stream::iter(chunks))
            .await
            .map_err(|s| self.status(s))?;
        Ok(resp.into_inner().package_ref)
    }

    async fn discard(&self, package_ref: &str) -> Result<(), AgentError> {
        let mut client = self.connect().await?;
        client
            .discard_package(DiscardPackageRequest {
                package_ref: package_ref.to_string(),
            })
            .await
            .map_err(|s| self.status(s))?;
        Ok(())
    }

    async fn execute(&self, request: ExecutePipelineRequest) -> Result<ExecutionResult, AgentError> {
        let mut client = self.connect().await?;
        let resp = client
            .execute_pipeline(request)
            .await
            .map_err(|s| self.status(s))?;
        Ok(resp.into_inner())
    }
}
