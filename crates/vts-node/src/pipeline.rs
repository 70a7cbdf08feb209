//! Per-device execution pipeline.
//!
//! A run walks `Idle -> Preparing -> Installing -> Launching -> Running ->
//! Terminating -> CollectingLogs -> Released`. Any failure moves it to
//! `Aborted`, and [`Pipeline::abort`] is the one cleanup routine for every
//! failing exit: it stops log capture, uninstalls what may have been
//! installed and force-releases the lock.

use std::{path::PathBuf, time::Duration};

use tracing::{info, warn};
use vts_proto::vts::v1::{ExecutionResult, RunStatus};

use crate::registry::Registry;
use crate::tool::{DeviceTool, ToolError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PipelineState {
    Idle,
    Preparing,
    Installing,
    Launching,
    Running,
    Terminating,
    CollectingLogs,
    Released,
    Aborted,
}

impl PipelineState {
    fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Preparing => "preparing",
            PipelineState::Installing => "installing",
            PipelineState::Launching => "launching",
            PipelineState::Running => "running",
            PipelineState::Terminating => "terminating",
            PipelineState::CollectingLogs => "collecting_logs",
            PipelineState::Released => "released",
            PipelineState::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PipelineRequest {
    pub(crate) device_id: String,
    pub(crate) owner_token: String,
    pub(crate) package_path: PathBuf,
    pub(crate) package_id: String,
    pub(crate) execution_time: Duration,
    pub(crate) launch_command: Option<String>,
}

#[derive(Debug)]
pub(crate) struct PipelineOutcome {
    pub(crate) status: RunStatus,
    pub(crate) log: Vec<u8>,
    pub(crate) error_detail: String,
    pub(crate) cleanup_warnings: Vec<String>,
    pub(crate) states: Vec<PipelineState>,
}

impl PipelineOutcome {
    pub(crate) fn into_proto(self, device_id: &str) -> ExecutionResult {
        ExecutionResult {
            device_id: device_id.to_string(),
            status: self.status as i32,
            log_payload: self.log,
            error_detail: self.error_detail,
            cleanup_warnings: self.cleanup_warnings,
            agent: String::new(),
        }
    }
}

struct Failure {
    status: RunStatus,
    detail: String,
}

impl Failure {
    fn new(status: RunStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    /// Tool timeouts are reported as such; anything else takes `status`.
    fn from_tool(status: RunStatus, context: &str, err: ToolError) -> Self {
        match err {
            ToolError::TimedOut(_) => Self::new(RunStatus::TimedOut, format!("{context}: {err}")),
            err => Self::new(status, format!("{context}: {err}")),
        }
    }
}

pub(crate) struct Pipeline<'a> {
    registry: &'a Registry,
    tool: &'a dyn DeviceTool,
    request: &'a PipelineRequest,
    state: PipelineState,
    history: Vec<PipelineState>,
    capture_started: bool,
    install_attempted: bool,
    warnings: Vec<String>,
}

/// Runs one pipeline against a device the caller has already locked with
/// `request.owner_token`. The lock is free again when this returns, unless
/// the device was never ours to begin with.
pub(crate) async fn run_pipeline(
    registry: &Registry,
    tool: &dyn DeviceTool,
    request: &PipelineRequest,
) -> PipelineOutcome {
    let mut pipeline = Pipeline {
        registry,
        tool,
        request,
        state: PipelineState::Idle,
        history: vec![PipelineState::Idle],
        capture_started: false,
        install_attempted: false,
        warnings: Vec::new(),
    };

    match registry.get(&request.device_id).await {
        Some(handle) if handle.lock.owner() == Some(request.owner_token.as_str()) => {}
        Some(_) => {
            return pipeline.rejected(
                RunStatus::LockConflict,
                format!("device {} is not locked by this request", request.device_id),
            )
        }
        None => {
            return pipeline.rejected(
                RunStatus::Failed,
                format!("device {} is not known to this host", request.device_id),
            )
        }
    }

    match pipeline.drive().await {
        Ok(log) => pipeline.finish(log).await,
        Err(failure) => pipeline.abort(failure).await,
    }
}

impl Pipeline<'_> {
    fn enter(&mut self, state: PipelineState) {
        info!(
            device = %self.request.device_id,
            from = self.state.as_str(),
            to = state.as_str(),
            "pipeline transition"
        );
        self.state = state;
        self.history.push(state);
    }

    fn warn(&mut self, message: String) {
        warn!(device = %self.request.device_id, state = self.state.as_str(), "{message}");
        self.warnings.push(message);
    }

    fn reached(&self, state: PipelineState) -> bool {
        self.history.contains(&state)
    }

    fn rejected(self, status: RunStatus, detail: String) -> PipelineOutcome {
        warn!(device = %self.request.device_id, "pipeline rejected: {detail}");
        PipelineOutcome {
            status,
            log: Vec::new(),
            error_detail: detail,
            cleanup_warnings: self.warnings,
            states: self.history,
        }
    }

    async fn drive(&mut self) -> Result<Vec<u8>, Failure> {
        let request = self.request;
        let tool = self.tool;

        self.enter(PipelineState::Preparing);
        let installed = tool
            .list_packages()
            .await
            .map_err(|e| Failure::from_tool(RunStatus::Failed, "query installed packages", e))?;
        if installed.iter().any(|p| p == &request.package_id) {
            info!(device = %request.device_id, package = %request.package_id, "removing stale install");
            tool.uninstall(&request.package_id)
                .await
                .map_err(|e| Failure::from_tool(RunStatus::Failed, "remove stale install", e))?;
        }
        tool.start_log_capture()
            .await
            .map_err(|e| Failure::from_tool(RunStatus::Failed, "start log capture", e))?;
        self.capture_started = true;
        tool.mark(&format!("installing {}", request.package_id)).await;

        self.enter(PipelineState::Installing);
        self.install_attempted = true;
        tool.install(&request.package_path)
            .await
            .map_err(|e| Failure::from_tool(RunStatus::InstallError, "install", e))?;
        let installed = tool
            .list_packages()
            .await
            .map_err(|e| Failure::from_tool(RunStatus::InstallError, "verify install", e))?;
        if !installed.iter().any(|p| p == &request.package_id) {
            return Err(Failure::new(
                RunStatus::InstallError,
                format!(
                    "package {} not present on device after install",
                    request.package_id
                ),
            ));
        }

        self.enter(PipelineState::Launching);
        tool.mark(&format!("launching {}", request.package_id)).await;
        tool.launch(&request.package_id, request.launch_command.as_deref())
            .await
            .map_err(|e| Failure::from_tool(RunStatus::LaunchError, "launch", e))?;

        self.enter(PipelineState::Running);
        tokio::time::sleep(request.execution_time).await;

        self.enter(PipelineState::Terminating);
        tool.mark(&format!("stopping {}", request.package_id)).await;
        if let Err(err) = tool.force_stop(&request.package_id).await {
            self.warn(format!("force-stop failed: {err}"));
        }

        self.enter(PipelineState::CollectingLogs);
        self.capture_started = false;
        let log = tool
            .stop_log_capture()
            .await
            .map_err(|e| Failure::from_tool(RunStatus::Failed, "collect device log", e))?;
        self.install_attempted = false;
        if let Err(err) = tool.uninstall(&request.package_id).await {
            self.warn(format!("uninstall failed: {err}"));
        }

        Ok(log)
    }

    async fn finish(mut self, log: Vec<u8>) -> PipelineOutcome {
        self.enter(PipelineState::Released);
        if let Err(err) = self
            .registry
            .release(&self.request.device_id, &self.request.owner_token)
            .await
        {
            self.warn(format!("release failed: {err}"));
        }
        PipelineOutcome {
            status: RunStatus::Success,
            log,
            error_detail: String::new(),
            cleanup_warnings: self.warnings,
            states: self.history,
        }
    }

    async fn abort(mut self, failure: Failure) -> PipelineOutcome {
        let failed_in = self.state;
        self.enter(PipelineState::Aborted);
        warn!(
            device = %self.request.device_id,
            state = failed_in.as_str(),
            "pipeline aborted: {}",
            failure.detail
        );

        let mut log = Vec::new();
        if self.capture_started {
            self.capture_started = false;
            let stopped = self.tool.stop_log_capture().await;
            match stopped {
                // Logs from before the launch describe only our own setup.
                Ok(captured) if self.reached(PipelineState::Launching) => log = captured,
                Ok(_) => {}
                Err(err) => self.warn(format!("stopping log capture failed: {err}")),
            }
        }

        if self.install_attempted {
            if let Err(err) = self.tool.uninstall(&self.request.package_id).await {
                self.warn(format!("uninstall failed: {err}"));
            }
        }

        if let Err(err) = self.registry.release_forced(&self.request.device_id).await {
            self.warn(format!("forced release failed: {err}"));
        }

        PipelineOutcome {
            status: failure.status,
            log,
            error_detail: format!("{} (during {})", failure.detail, failed_in.as_str()),
            cleanup_warnings: self.warnings,
            states: self.history,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashSet,
        path::Path,
        sync::{Arc, Mutex as StdMutex},
    };

    use super::*;
    use crate::registry::tests::{found, StaticBridge};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) enum Step {
        ListPackages,
        StartCapture,
        Install,
        Verify,
        Launch,
        LaunchTimeout,
        ForceStop,
        StopCapture,
        Uninstall,
    }

    const ALL_STEPS: [Step; 9] = [
        Step::ListPackages,
        Step::StartCapture,
        Step::Install,
        Step::Verify,
        Step::Launch,
        Step::LaunchTimeout,
        Step::ForceStop,
        Step::StopCapture,
        Step::Uninstall,
    ];

    /// In-memory device that records every call and can fail one step.
    #[derive(Default)]
    pub(crate) struct FakeTool {
        pub(crate) calls: StdMutex<Vec<String>>,
        pub(crate) installed: StdMutex<HashSet<String>>,
        pub(crate) fail: Option<Step>,
        capturing: StdMutex<bool>,
    }

    impl FakeTool {
        pub(crate) fn failing(step: Step) -> Self {
            Self {
                fail: Some(step),
                ..Default::default()
            }
        }

        pub(crate) fn with_installed(package: &str) -> Self {
            let tool = Self::default();
            tool.installed.lock().unwrap().insert(package.to_string());
            tool
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn fails(&self, step: Step) -> Result<(), ToolError> {
            if self.fail == Some(step) {
                Err(ToolError::Exit {
                    status: 1,
                    stdout: String::new(),
                    stderr: format!("injected {step:?} failure"),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tonic::async_trait]
    impl DeviceTool for FakeTool {
        async fn list_packages(&self) -> Result<Vec<String>, ToolError> {
            self.record("list_packages");
            self.fails(Step::ListPackages)?;
            Ok(self.installed.lock().unwrap().iter().cloned().collect())
        }

        async fn uninstall(&self, package_id: &str) -> Result<(), ToolError> {
            self.record("uninstall");
            self.fails(Step::Uninstall)?;
            if self.installed.lock().unwrap().remove(package_id) {
                Ok(())
            } else {
                Err(ToolError::Exit {
                    status: 1,
                    stdout: "Failure [DELETE_FAILED_INTERNAL_ERROR]".into(),
                    stderr: String::new(),
                })
            }
        }

        async fn install(&self, _path: &Path) -> Result<(), ToolError> {
            self.record("install");
            self.fails(Step::Install)?;
            if self.fail != Some(Step::Verify) {
                self.installed.lock().unwrap().insert(PACKAGE.to_string());
            }
            Ok(())
        }

        async fn launch(&self, _package_id: &str, _command: Option<&str>) -> Result<(), ToolError> {
            self.record("launch");
            if self.fail == Some(Step::LaunchTimeout) {
                return Err(ToolError::TimedOut(Duration::from_secs(10)));
            }
            self.fails(Step::Launch)
        }

        async fn force_stop(&self, _package_id: &str) -> Result<(), ToolError> {
            self.record("force_stop");
            self.fails(Step::ForceStop)
        }

        async fn start_log_capture(&self) -> Result<(), ToolError> {
            self.record("start_log_capture");
            self.fails(Step::StartCapture)?;
            *self.capturing.lock().unwrap() = true;
            Ok(())
        }

        async fn stop_log_capture(&self) -> Result<Vec<u8>, ToolError> {
            self.record("stop_log_capture");
            let was_capturing = std::mem::replace(&mut *self.capturing.lock().unwrap(), false);
            assert!(was_capturing, "log capture stopped twice");
            self.fails(Step::StopCapture)?;
            Ok(b"I/ActivityManager: Start proc com.example.app\n".to_vec())
        }

        async fn mark(&self, _message: &str) {}
    }

    pub(crate) const PACKAGE: &str = "com.example.app";

    async fn locked_registry(owner: &str) -> Arc<Registry> {
        let bridge = StaticBridge::with(vec![found("d1", "arm64-v8a")]);
        let registry = Arc::new(Registry::new(bridge, Duration::from_millis(200)));
        registry.discover().await.unwrap();
        registry
            .acquire("d1", owner, Duration::from_millis(200))
            .await
            .unwrap();
        registry
    }

    fn request(owner: &str, secs: u64) -> PipelineRequest {
        PipelineRequest {
            device_id: "d1".into(),
            owner_token: owner.into(),
            package_path: PathBuf::from("/tmp/pkg.apk"),
            package_id: PACKAGE.into(),
            execution_time: Duration::from_secs(secs),
            launch_command: None,
        }
    }

    async fn assert_available(registry: &Registry) {
        let handle = registry.get("d1").await.unwrap();
        assert!(!handle.lock.is_locked(), "lock leaked: {:?}", handle.lock);
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_runs_every_state_in_order() {
        let registry = locked_registry("t1").await;
        let tool = FakeTool::default();

        let start = tokio::time::Instant::now();
        let outcome = run_pipeline(&registry, &tool, &request("t1", 5)).await;
        let elapsed = start.elapsed();

        assert_eq!(outcome.status, RunStatus::Success);
        assert!(outcome.error_detail.is_empty());
        assert!(outcome.cleanup_warnings.is_empty());
        assert!(!outcome.log.is_empty());
        assert_eq!(
            outcome.states,
            [
                PipelineState::Idle,
                PipelineState::Preparing,
                PipelineState::Installing,
                PipelineState::Launching,
                PipelineState::Running,
                PipelineState::Terminating,
                PipelineState::CollectingLogs,
                PipelineState::Released,
            ]
        );
        assert_eq!(
            tool.calls(),
            [
                "list_packages",
                "start_log_capture",
                "install",
                "list_packages",
                "launch",
                "force_stop",
                "stop_log_capture",
                "uninstall",
            ]
        );
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert!(tool.installed.lock().unwrap().is_empty());
        assert_available(&registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_install_is_removed_before_installing() {
        let registry = locked_registry("t1").await;
        let tool = FakeTool::with_installed(PACKAGE);

        let outcome = run_pipeline(&registry, &tool, &request("t1", 1)).await;

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(
            &tool.calls()[..4],
            ["list_packages", "uninstall", "start_log_capture", "install"]
        );
        assert_available(&registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn install_failure_skips_launch_and_discards_log() {
        let registry = locked_registry("t1").await;
        let tool = FakeTool::failing(Step::Install);

        let outcome = run_pipeline(&registry, &tool, &request("t1", 5)).await;

        assert_eq!(outcome.status, RunStatus::InstallError);
        assert!(outcome.error_detail.contains("install"));
        assert!(outcome.log.is_empty());
        let calls = tool.calls();
        assert!(calls.contains(&"stop_log_capture".to_string()));
        assert!(!calls.contains(&"launch".to_string()));
        assert!(!calls.contains(&"force_stop".to_string()));
        assert!(!outcome.states.contains(&PipelineState::Running));
        assert_eq!(outcome.states.last(), Some(&PipelineState::Aborted));
        assert_available(&registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_package_after_install_is_an_install_error() {
        let registry = locked_registry("t1").await;
        let tool = FakeTool::failing(Step::Verify);

        let outcome = run_pipeline(&registry, &tool, &request("t1", 5)).await;

        assert_eq!(outcome.status, RunStatus::InstallError);
        assert!(outcome.error_detail.contains("not present"));
        assert_available(&registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_still_uninstalls_and_keeps_log() {
        let registry = locked_registry("t1").await;
        let tool = FakeTool::failing(Step::Launch);

        let outcome = run_pipeline(&registry, &tool, &request("t1", 5)).await;

        assert_eq!(outcome.status, RunStatus::LaunchError);
        assert!(!outcome.log.is_empty());
        let calls = tool.calls();
        assert_eq!(calls.last().map(String::as_str), Some("uninstall"));
        assert!(!calls.contains(&"force_stop".to_string()));
        assert!(tool.installed.lock().unwrap().is_empty());
        assert_available(&registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn launch_timeout_reports_timed_out() {
        let registry = locked_registry("t1").await;
        let tool = FakeTool::failing(Step::LaunchTimeout);

        let outcome = run_pipeline(&registry, &tool, &request("t1", 5)).await;

        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert_available(&registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn best_effort_cleanup_failures_are_warnings() {
        for step in [Step::ForceStop, Step::Uninstall] {
            let registry = locked_registry("t1").await;
            let tool = FakeTool::failing(step);

            let outcome = run_pipeline(&registry, &tool, &request("t1", 1)).await;

            assert_eq!(outcome.status, RunStatus::Success, "{step:?}");
            assert_eq!(outcome.cleanup_warnings.len(), 1, "{step:?}");
            assert_available(&registry).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lock_is_free_after_failure_at_every_step() {
        for step in ALL_STEPS {
            let registry = locked_registry("t1").await;
            let tool = FakeTool::failing(step);

            let outcome = run_pipeline(&registry, &tool, &request("t1", 2)).await;

            let expected = match step {
                Step::ListPackages | Step::StartCapture | Step::StopCapture => RunStatus::Failed,
                Step::Install | Step::Verify => RunStatus::InstallError,
                Step::Launch => RunStatus::LaunchError,
                Step::LaunchTimeout => RunStatus::TimedOut,
                Step::ForceStop | Step::Uninstall => RunStatus::Success,
            };
            assert_eq!(outcome.status, expected, "{step:?}");
            assert_available(&registry).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_lock_is_never_touched() {
        let registry = locked_registry("t0").await;
        let tool = FakeTool::default();

        let outcome = run_pipeline(&registry, &tool, &request("t1", 5)).await;

        assert_eq!(outcome.status, RunStatus::LockConflict);
        assert!(tool.calls().is_empty());
        assert_eq!(registry.get("d1").await.unwrap().lock.owner(), Some("t0"));
    }
}
