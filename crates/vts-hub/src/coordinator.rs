//! Routing and aggregation across host agents.
//!
//! An execution resolves every selector against the [`Directory`] before it
//! touches anything, packages once, locks every device under one owner token
//! and only then fans out. A device that cannot be locked releases the rest,
//! unless its agent is unreachable, which fails only that agent's devices.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;
use vts_proto::vts::v1::{
    Device, ExecutePipelineRequest, ExecutionResult, ListDevicesRequest, RunStatus,
};

use crate::agents::{AgentClient, AgentError};
use crate::directory::{Directory, Selector};
use crate::packaging::{Packager, PackagingError};

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExecuteError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("unknown devices: {}", .0.join(", "))]
    UnknownDevice(Vec<String>),
    #[error(transparent)]
    Packaging(#[from] PackagingError),
}

#[derive(Clone, Debug)]
pub(crate) struct ExecuteRequest {
    pub(crate) file_name: String,
    pub(crate) package: Vec<u8>,
    pub(crate) selectors: Vec<String>,
    pub(crate) execution_time: Duration,
    pub(crate) sign: bool,
    pub(crate) launch_command: Option<String>,
}

pub(crate) struct Coordinator {
    directory: Arc<Directory>,
    packager: Arc<dyn Packager>,
    lock_wait: Duration,
    max_execution: Duration,
}

fn device_result(target: &Selector, status: RunStatus, detail: impl Into<String>) -> ExecutionResult {
    ExecutionResult {
        device_id: target.device_id.clone(),
        status: status as i32,
        log_payload: Vec::new(),
        error_detail: detail.into(),
        cleanup_warnings: Vec::new(),
        agent: target.agent.clone(),
    }
}

/// Every acquire error except an unreachable agent aborts the whole request.
fn aborts_request(acquired: &Result<(), AgentError>) -> bool {
    matches!(acquired, Err(err) if !matches!(err, AgentError::Unreachable { .. }))
}

fn agent_failure(target: &Selector, err: &AgentError) -> ExecutionResult {
    let detail = match err {
        AgentError::Unreachable { .. } => err.to_string(),
        other => format!("agent {}: {other}", target.agent),
    };
    device_result(target, RunStatus::Failed, detail)
}

impl Coordinator {
    pub(crate) fn new(
        directory: Arc<Directory>,
        packager: Arc<dyn Packager>,
        lock_wait: Duration,
        max_execution: Duration,
    ) -> Self {
        Self {
            directory,
            packager,
            lock_wait,
            max_execution,
        }
    }

    /// Merged listing across every agent, capped after the merge. Agents
    /// that do not answer are left out.
    pub(crate) async fn list_devices(&self, architectures: Vec<i32>, amount: usize) -> Vec<Device> {
        let request = ListDevicesRequest {
            architectures,
            amount: 0,
            refresh: false,
            include_unreachable: false,
        };
        let listings = join_all(self.directory.agents().iter().map(|agent| {
            let request = request.clone();
            async move { (agent.name().to_string(), agent.list_devices(request).await) }
        }))
        .await;

        let mut devices = Vec::new();
        for (agent, listing) in listings {
            match listing {
                Ok(found) => devices.extend(found.into_iter().map(|mut device| {
                    device.selector = Selector::format(&device.device_id, &agent);
                    device.agent = agent.clone();
                    device
                })),
                Err(err) => warn!(agent = %agent, "listing failed: {err}"),
            }
        }
        if amount > 0 {
            devices.truncate(amount);
        }
        devices
    }

    fn validate(&self, request: &ExecuteRequest) -> Result<Vec<Selector>, ExecuteError> {
        if request.selectors.is_empty() {
            return Err(ExecuteError::InvalidRequest("no devices selected".into()));
        }
        let secs = request.execution_time.as_secs();
        if secs == 0 || request.execution_time > self.max_execution {
            return Err(ExecuteError::InvalidRequest(format!(
                "execution time must be between 1 and {} seconds",
                self.max_execution.as_secs()
            )));
        }

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(request.selectors.len());
        for raw in &request.selectors {
            let selector = Selector::parse(raw).ok_or_else(|| {
                ExecuteError::InvalidRequest(format!(
                    "invalid device selector {raw:?}, expected <device_id>_<agent>"
                ))
            })?;
            if !seen.insert(selector.clone()) {
                return Err(ExecuteError::InvalidRequest(format!(
                    "device {selector} selected twice"
                )));
            }
            targets.push(selector);
        }
        Ok(targets)
    }

    async fn acquire(&self, target: &Selector, owner: &str) -> Result<(), AgentError> {
        let agent = self.agent(target)?;
        agent.acquire(&target.device_id, owner, self.lock_wait).await
    }

    async fn release(&self, target: &Selector, owner: &str) {
        let Ok(agent) = self.agent(target) else {
            return;
        };
        if let Err(err) = agent.release(&target.device_id, owner).await {
            warn!(device = %target, "release failed: {err}");
        }
    }

    fn agent(&self, target: &Selector) -> Result<Arc<dyn AgentClient>, AgentError> {
        self.directory
            .agent(&target.agent)
            .ok_or_else(|| AgentError::NotFound(format!("no agent named {}", target.agent)))
    }

    pub(crate) async fn execute(
        &self,
        request: ExecuteRequest,
    ) -> Result<Vec<ExecutionResult>, ExecuteError> {
        let targets = self.validate(&request)?;
        let unknown = self.directory.unknown(&targets).await;
        if !unknown.is_empty() {
            return Err(ExecuteError::UnknownDevice(
                unknown.iter().map(Selector::to_string).collect(),
            ));
        }

        let ExecuteRequest {
            file_name,
            package,
            execution_time,
            sign,
            launch_command,
            ..
        } = request;
        let installable = self
            .packager
            .produce_installable(&file_name, package, sign)
            .await?;

        let owner = Uuid::new_v4().to_string();
        info!(
            owner = %owner,
            devices = targets.len(),
            package = %installable.package_id,
            "dispatching execution"
        );

        let acquisitions = join_all(targets.iter().map(|target| self.acquire(target, &owner))).await;
        if acquisitions.iter().any(aborts_request) {
            join_all(
                targets
                    .iter()
                    .zip(&acquisitions)
                    .filter(|(_, acquired)| acquired.is_ok())
                    .map(|(target, _)| self.release(target, &owner)),
            )
            .await;
            warn!(owner = %owner, "device could not be locked, request aborted");
            return Ok(targets
                .iter()
                .zip(acquisitions)
                .map(|(target, acquired)| match acquired {
                    Ok(()) => device_result(
                        target,
                        RunStatus::Aborted,
                        "not run: another device in this request could not be locked",
                    ),
                    Err(AgentError::LockConflict(detail)) => {
                        device_result(target, RunStatus::LockConflict, detail)
                    }
                    Err(err) => agent_failure(target, &err),
                })
                .collect());
        }

        // One upload per agent that holds at least one locked device.
        let mut agents: Vec<String> = Vec::new();
        for (target, acquired) in targets.iter().zip(&acquisitions) {
            if acquired.is_ok() && !agents.contains(&target.agent) {
                agents.push(target.agent.clone());
            }
        }
        let data = Arc::new(installable.data);
        let uploads: Vec<(String, Result<String, AgentError>)> =
            join_all(agents.iter().map(|name| {
                let data = Arc::clone(&data);
                let file_name = installable.file_name.as_str();
                async move {
                    let uploaded = match self.directory.agent(name) {
                        Some(agent) => agent.upload(file_name, data).await,
                        None => Err(AgentError::NotFound(format!("no agent named {name}"))),
                    };
                    (name.clone(), uploaded)
                }
            }))
            .await;
        let package_ref = |agent: &str| {
            uploads
                .iter()
                .find(|(name, _)| name == agent)
                .map(|(_, uploaded)| uploaded)
        };

        let execution_time_secs = u32::try_from(execution_time.as_secs()).unwrap_or(u32::MAX);
        let launch_command = launch_command.unwrap_or_default();
        let results = join_all(targets.iter().zip(acquisitions).map(|(target, acquired)| {
            let owner = owner.as_str();
            let package_id = installable.package_id.as_str();
            let launch_command = launch_command.as_str();
            let uploaded = package_ref(&target.agent);
            async move {
                if let Err(err) = acquired {
                    return agent_failure(target, &err);
                }
                match uploaded {
                    Some(Ok(package_ref)) => {
                        let call = ExecutePipelineRequest {
                            device_id: target.device_id.clone(),
                            owner_token: owner.to_string(),
                            package_ref: package_ref.clone(),
                            package_id: package_id.to_string(),
                            execution_time_secs,
                            launch_command: launch_command.to_string(),
                        };
                        self.run_device(target, call).await
                    }
                    Some(Err(err)) => {
                        self.release(target, owner).await;
                        let mut result = agent_failure(target, err);
                        result.error_detail = format!("package upload failed: {}", result.error_detail);
                        result
                    }
                    None => {
                        self.release(target, owner).await;
                        device_result(target, RunStatus::Failed, "package was not uploaded")
                    }
                }
            }
        }))
        .await;

        join_all(uploads.iter().filter_map(|(name, uploaded)| {
            let package_ref = uploaded.as_ref().ok()?;
            let agent = self.directory.agent(name)?;
            Some(async move {
                if let Err(err) = agent.discard(package_ref).await {
                    warn!(agent = %name, "discarding package failed: {err}");
                }
            })
        }))
        .await;

        info!(owner = %owner, "execution finished");
        Ok(results)
    }

    /// A failed call leaves the lock alone: the agent may still be running the
    /// pipeline, and it releases the device itself when the pipeline ends.
    async fn run_device(&self, target: &Selector, call: ExecutePipelineRequest) -> ExecutionResult {
        let agent = match self.agent(target) {
            Ok(agent) => agent,
            Err(err) => return agent_failure(target, &err),
        };
        match agent.execute(call).await {
            Ok(mut result) => {
                result.agent = target.agent.clone();
                result
            }
            Err(err) => {
                warn!(device = %target, "pipeline call failed: {err}");
                agent_failure(target, &err)
            }
        }
    }
}
