use std::{sync::Arc, time::Duration};

use tonic::{Request, Response, Status, Streaming};
use tracing::{error, info, warn};
use vts_proto::vts::v1::{
    node_service_server::NodeService, AcquireDeviceRequest, AcquireDeviceResponse, Architecture,
    DiscardPackageRequest, DiscardPackageResponse, ExecutePipelineRequest, ExecutionResult,
    ForceReleaseDeviceRequest, ForceReleaseDeviceResponse, ListDevicesRequest,
    ListDevicesResponse, ReleaseDeviceRequest, ReleaseDeviceResponse, RunStatus,
    UploadPackageChunk, UploadPackageResponse,
};

use crate::config::NodeConfig;
use crate::ids::normalize_device_id;
use crate::packages::{PackageError, PackageStore};
use crate::pipeline::{run_pipeline, PipelineRequest};
use crate::registry::{ListFilter, LockError, Registry};
use crate::tool::{DeviceBridge, DeviceTool};

#[derive(Clone)]
pub(crate) struct Svc {
    registry: Arc<Registry>,
    bridge: Arc<dyn DeviceBridge>,
    packages: Arc<PackageStore>,
    config: NodeConfig,
}

impl Svc {
    pub(crate) fn new(
        registry: Arc<Registry>,
        bridge: Arc<dyn DeviceBridge>,
        packages: Arc<PackageStore>,
        config: NodeConfig,
    ) -> Self {
        Self {
            registry,
            bridge,
            packages,
            config,
        }
    }

    #[allow(clippy::result_large_err)]
    fn validate(&self, req: &ExecutePipelineRequest) -> Result<PipelineRequest, Status> {
        let secs = u64::from(req.execution_time_secs);
        if secs == 0 || secs > self.config.max_execution.as_secs() {
            return Err(Status::invalid_argument(format!(
                "execution_time_secs must be between 1 and {}",
                self.config.max_execution.as_secs()
            )));
        }
        let package_id = req.package_id.trim();
        if package_id.is_empty() {
            return Err(Status::invalid_argument("package_id is required"));
        }
        let package_path = self.packages.resolve(&req.package_ref).map_err(package_status)?;
        let launch_command = Some(req.launch_command.trim())
            .filter(|cmd| !cmd.is_empty())
            .map(str::to_string);

        Ok(PipelineRequest {
            device_id: normalize_device_id(&req.device_id),
            owner_token: req.owner_token.clone(),
            package_path,
            package_id: package_id.to_string(),
            execution_time: Duration::from_secs(secs),
            launch_command,
        })
    }
}

fn lock_status(err: LockError) -> Status {
    match err {
        LockError::NotFound(_) => Status::not_found(err.to_string()),
        LockError::LockConflict { .. } | LockError::TimedOut(_) => Status::aborted(err.to_string()),
        LockError::NotOwner(_) => Status::permission_denied(err.to_string()),
        LockError::NotLocked(_) => Status::failed_precondition(err.to_string()),
    }
}

fn package_status(err: PackageError) -> Status {
    match err {
        PackageError::Invalid(_) => Status::invalid_argument(err.to_string()),
        PackageError::Missing(_) => Status::not_found(err.to_string()),
        PackageError::Io(_) => Status::internal(err.to_string()),
    }
}

#[allow(clippy::result_large_err)]
fn require(value: &str, field: &str) -> Result<String, Status> {
    let value = normalize_device_id(value);
    if value.is_empty() {
        Err(Status::invalid_argument(format!("{field} is required")))
    } else {
        Ok(value)
    }
}

#[tonic::async_trait]
impl NodeService for Svc {
    async fn list_devices(
        &self,
        request: Request<ListDevicesRequest>,
    ) -> Result<Response<ListDevicesResponse>, Status> {
        let req = request.into_inner();
        let architectures = req
            .architectures
            .iter()
            .map(|value| {
                Architecture::try_from(*value).map_err(|_| {
                    Status::invalid_argument(format!("unknown architecture value {value}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if req.refresh {
            if let Err(err) = self.registry.discover().await {
                warn!("device discovery failed, serving cached registry: {err}");
            }
        }

        let filter = ListFilter {
            architectures,
            amount: req.amount as usize,
            include_unreachable: req.include_unreachable,
        };
        let devices = self
            .registry
            .list(&filter)
            .await
            .iter()
            .map(|handle| handle.to_proto())
            .collect();
        Ok(Response::new(ListDevicesResponse { devices }))
    }

    async fn acquire_device(
        &self,
        request: Request<AcquireDeviceRequest>,
    ) -> Result<Response<AcquireDeviceResponse>, Status> {
        let req = request.into_inner();
        let device_id = require(&req.device_id, "device_id")?;
        if req.owner_token.trim().is_empty() {
            return Err(Status::invalid_argument("owner_token is required"));
        }
        let wait = if req.wait_millis == 0 {
            self.registry.default_lock_wait()
        } else {
            Duration::from_millis(u64::from(req.wait_millis))
        };

        let handle = self
            .registry
            .acquire(&device_id, &req.owner_token, wait)
            .await
            .map_err(lock_status)?;
        Ok(Response::new(AcquireDeviceResponse {
            device: Some(handle.to_proto()),
        }))
    }

    async fn release_device(
        &self,
        request: Request<ReleaseDeviceRequest>,
    ) -> Result<Response<ReleaseDeviceResponse>, Status> {
        let req = request.into_inner();
        let device_id = require(&req.device_id, "device_id")?;
        self.registry
            .release(&device_id, &req.owner_token)
            .await
            .map_err(lock_status)?;
        Ok(Response::new(ReleaseDeviceResponse {}))
    }

    async fn force_release_device(
        &self,
        request: Request<ForceReleaseDeviceRequest>,
    ) -> Result<Response<ForceReleaseDeviceResponse>, Status> {
        let req = request.into_inner();
        let device_id = require(&req.device_id, "device_id")?;
        let previous_owner = self
            .registry
            .release_forced(&device_id)
            .await
            .map_err(lock_status)?;
        Ok(Response::new(ForceReleaseDeviceResponse {
            previous_owner: previous_owner.unwrap_or_default(),
        }))
    }

    async fn upload_package(
        &self,
        request: Request<Streaming<UploadPackageChunk>>,
    ) -> Result<Response<UploadPackageResponse>, Status> {
        let mut stream = request.into_inner();
        let Some(first) = stream.message().await? else {
            return Err(Status::invalid_argument("upload carried no chunks"));
        };
        let mut writer = self
            .packages
            .create(&first.file_name)
            .await
            .map_err(package_status)?;

        let mut next = Some(first);
        while let Some(chunk) = next {
            if let Err(err) = writer.write(&chunk.data).await {
                writer.abandon().await;
                return Err(package_status(err));
            }
            next = match stream.message().await {
                Ok(chunk) => chunk,
                Err(status) => {
                    writer.abandon().await;
                    return Err(status);
                }
            };
        }

        let (package_ref, size_bytes) = writer.finish().await.map_err(package_status)?;
        Ok(Response::new(UploadPackageResponse {
            package_ref,
            size_bytes,
        }))
    }

    async fn discard_package(
        &self,
        request: Request<DiscardPackageRequest>,
    ) -> Result<Response<DiscardPackageResponse>, Status> {
        let req = request.into_inner();
        self.packages
            .discard(&req.package_ref)
            .await
            .map_err(package_status)?;
        Ok(Response::new(DiscardPackageResponse {}))
    }

    async fn execute_pipeline(
        &self,
        request: Request<ExecutePipelineRequest>,
    ) -> Result<Response<ExecutionResult>, Status> {
        let req = request.into_inner();
        let device_id = require(&req.device_id, "device_id")?;
        if req.owner_token.trim().is_empty() {
            return Err(Status::invalid_argument("owner_token is required"));
        }

        let pipeline_request = match self.validate(&req) {
            Ok(pipeline_request) => pipeline_request,
            Err(status) => {
                if let Err(err) = self.registry.release(&device_id, &req.owner_token).await {
                    warn!(device = %device_id, "release after rejected request failed: {err}");
                }
                return Err(status);
            }
        };

        info!(
            device = %device_id,
            package = %pipeline_request.package_id,
            secs = pipeline_request.execution_time.as_secs(),
            "starting pipeline"
        );
        // The supervisor outlives a dropped caller, so the lock is always settled.
        let task = tokio::spawn(supervise_pipeline(
            Arc::clone(&self.registry),
            self.bridge.tool(&device_id),
            pipeline_request,
            device_id,
        ));
        let result = task.await.map_err(|err| {
            error!("pipeline supervisor failed: {err}");
            Status::internal(format!("pipeline supervisor failed: {err}"))
        })?;
        Ok(Response::new(result))
    }
}

/// Runs one pipeline in its own task. A panic in the pipeline still force
/// releases the device.
async fn supervise_pipeline(
    registry: Arc<Registry>,
    tool: Box<dyn DeviceTool>,
    request: PipelineRequest,
    device_id: String,
) -> ExecutionResult {
    let pipeline_registry = Arc::clone(&registry);
    let run = tokio::spawn(async move {
        run_pipeline(&pipeline_registry, tool.as_ref(), &request).await
    });

    match run.await {
        Ok(outcome) => {
            info!(device = %device_id, status = ?outcome.status, states = ?outcome.states, "pipeline finished");
            outcome.into_proto(&device_id)
        }
        Err(err) => {
            error!(device = %device_id, "pipeline task failed: {err}");
            let mut warnings = Vec::new();
            if let Err(err) = registry.release_forced(&device_id).await {
                warnings.push(format!("forced release failed: {err}"));
            }
            ExecutionResult {
                device_id,
                status: RunStatus::Failed as i32,
                log_payload: Vec::new(),
                error_detail: format!("pipeline task failed: {err}"),
                cleanup_warnings: warnings,
                agent: String::new(),
            }
        }
    }
}
