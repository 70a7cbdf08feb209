use std::{path::Path, time::Duration};

use crate::device::DiscoveredDevice;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ToolError {
    #[error("adb not found (set VTS_ADB_PATH or ANDROID_SDK_ROOT)")]
    NotFound,
    #[error("{0}")]
    Io(String),
    #[error("{}", exit_message(.status, .stdout, .stderr))]
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
    #[error("device command timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("{0}")]
    Rejected(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ToolError::NotFound
        } else {
            ToolError::Io(err.to_string())
        }
    }
}

pub(crate) fn format_tool_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();

    if !stdout.is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout);
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(stderr);
        out.push('\n');
    }

    out
}

fn exit_message(status: &i32, stdout: &str, stderr: &str) -> String {
    let detail = format_tool_output(stdout, stderr);
    if detail.trim().is_empty() {
        format!("adb command failed with exit {status}")
    } else {
        format!("adb command failed with exit {status}: {}", detail.trim())
    }
}

/// Probes the devices attached to this host and hands out per-device tools.
#[tonic::async_trait]
pub(crate) trait DeviceBridge: Send + Sync {
    async fn probe(&self) -> Result<Vec<DiscoveredDevice>, ToolError>;

    /// A fresh tool for one pipeline run; log capture state lives in it.
    fn tool(&self, device_id: &str) -> Box<dyn DeviceTool>;
}

/// Operations the pipeline needs from one physical device.
#[tonic::async_trait]
pub(crate) trait DeviceTool: Send + Sync {
    async fn list_packages(&self) -> Result<Vec<String>, ToolError>;

    async fn uninstall(&self, package_id: &str) -> Result<(), ToolError>;

    async fn install(&self, path: &Path) -> Result<(), ToolError>;

    /// `command` replaces the default launcher invocation when set.
    async fn launch(&self, package_id: &str, command: Option<&str>) -> Result<(), ToolError>;

    async fn force_stop(&self, package_id: &str) -> Result<(), ToolError>;

    async fn start_log_capture(&self) -> Result<(), ToolError>;

    async fn stop_log_capture(&self) -> Result<Vec<u8>, ToolError>;

    /// Best-effort marker written into the device log.
    async fn mark(&self, message: &str);
}
