use std::{sync::Arc, time::Duration};

use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info};
use vts_proto::vts::v1::{
    execute_chunk::Payload, hub_service_server::HubService, ExecuteChunk, ExecuteHeader,
    ExecuteResponse, HubListDevicesRequest, HubListDevicesResponse,
};
use vts_util::MAX_MESSAGE_BYTES;

use crate::coordinator::{Coordinator, ExecuteError, ExecuteRequest};

#[derive(Clone)]
pub(crate) struct Svc {
    coordinator: Arc<Coordinator>,
}

impl Svc {
    pub(crate) fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

fn execute_status(err: ExecuteError) -> Status {
    match err {
        ExecuteError::InvalidRequest(_) => Status::invalid_argument(err.to_string()),
        ExecuteError::UnknownDevice(_) => Status::not_found(err.to_string()),
        ExecuteError::Packaging(_) => Status::failed_precondition(err.to_string()),
    }
}

/// Reads the header chunk followed by the package bytes.
async fn receive_execute(
    stream: &mut Streaming<ExecuteChunk>,
) -> Result<(ExecuteHeader, Vec<u8>), Status> {
    let header = match stream.message().await? {
        Some(ExecuteChunk {
            payload: Some(Payload::Header(header)),
        }) => header,
        _ => return Err(Status::invalid_argument("first chunk must carry the header")),
    };

    let mut package = Vec::new();
    while let Some(chunk) = stream.message().await? {
        match chunk.payload {
            Some(Payload::Data(data)) => {
                if package.len() + data.len() > MAX_MESSAGE_BYTES {
                    return Err(Status::resource_exhausted(format!(
                        "package exceeds {MAX_MESSAGE_BYTES} bytes"
                    )));
                }
                package.extend_from_slice(&data);
            }
            Some(Payload::Header(_)) => {
                return Err(Status::invalid_argument("header sent twice"));
            }
            None => {}
        }
    }
    Ok((header, package))
}

#[tonic::async_trait]
impl HubService for Svc {
    async fn list_devices(
        &self,
        request: Request<HubListDevicesRequest>,
    ) -> Result<Response<HubListDevicesResponse>, Status> {
        let req = request.into_inner();
        let devices = self
            .coordinator
            .list_devices(req.architectures, req.amount as usize)
            .await;
        Ok(Response::new(HubListDevicesResponse { devices }))
    }

    async fn execute(
        &self,
        request: Request<Streaming<ExecuteChunk>>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let mut stream = request.into_inner();
        let (header, package) = receive_execute(&mut stream).await?;
        info!(
            file = %header.file_name,
            devices = header.device_selectors.len(),
            size = package.len(),
            "execute request received"
        );

        let launch_command = Some(header.launch_command.trim())
            .filter(|cmd| !cmd.is_empty())
            .map(str::to_string);
        let execute = ExecuteRequest {
            file_name: header.file_name,
            package,
            selectors: header.device_selectors,
            execution_time: Duration::from_secs(u64::from(header.execution_time_secs)),
            sign: header.sign,
            launch_command,
        };

        // Locks taken on the agents are settled even if the caller goes away.
        let coordinator = Arc::clone(&self.coordinator);
        let results = tokio::spawn(async move { coordinator.execute(execute).await })
            .await
            .map_err(|err| {
                error!("execution task failed: {err}");
                Status::internal(format!("execution task failed: {err}"))
            })?
            .map_err(execute_status)?;
        Ok(Response::new(ExecuteResponse { results }))
    }
}
