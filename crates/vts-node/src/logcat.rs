use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::tool::ToolError;

/// A running `adb logcat` stream spooled into a scratch file.
pub(crate) struct LogCapture {
    child: Child,
    path: PathBuf,
}

impl LogCapture {
    pub(crate) async fn start(adb: &Path, serial: &str, path: PathBuf) -> Result<Self, ToolError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ToolError::Io(format!("create {}: {e}", path.display())))?
            .into_std()
            .await;

        let child = Command::new(adb)
            .arg("-s")
            .arg(serial)
            .arg("logcat")
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        debug!(device = %serial, file = %path.display(), "log capture started");
        Ok(Self { child, path })
    }

    /// Ends the stream and returns everything captured. The scratch file is
    /// removed either way.
    pub(crate) async fn stop(mut self) -> Result<Vec<u8>, ToolError> {
        if let Ok(None) = self.child.try_wait() {
            if let Err(err) = self.child.kill().await {
                warn!(file = %self.path.display(), "failed to kill logcat: {err}");
            }
        }
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ToolError::Io(format!("read {}: {e}", self.path.display())));
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            debug!(file = %self.path.display(), "failed to remove log scratch file: {err}");
        }
        data
    }
}
