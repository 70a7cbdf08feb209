use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Output,
    sync::Arc,
    time::Duration,
};

use tokio::{
    process::Command,
    sync::{Mutex, Semaphore},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::device::DiscoveredDevice;
use crate::ids::{canonicalize_adb_serial, normalize_device_id};
use crate::logcat::LogCapture;
use crate::tool::{DeviceBridge, DeviceTool, ToolError};

const PROP_TIMEOUT: Duration = Duration::from_secs(3);
const MARKER_TAG: &str = "VTS_PIPELINE";
const LAUNCHER_CATEGORY: &str = "android.intent.category.LAUNCHER";

pub(crate) fn adb_path() -> PathBuf {
    for key in ["VTS_ADB_PATH", "ADB_PATH"] {
        if let Ok(path) = std::env::var(key) {
            return PathBuf::from(path);
        }
    }
    if let Ok(sdk_root) =
        std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME"))
    {
        for name in ["adb", "adb.exe"] {
            let candidate = PathBuf::from(&sdk_root).join("platform-tools").join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("adb")
}

/// Shared adb invocation context. Every command holds one permit from the
/// host-wide semaphore while it runs.
#[derive(Clone)]
pub(crate) struct Adb {
    path: PathBuf,
    timeout: Duration,
    install_timeout: Duration,
    permits: Arc<Semaphore>,
    scratch_dir: PathBuf,
}

impl Adb {
    pub(crate) fn new(config: &NodeConfig) -> Self {
        Self {
            path: config.adb_path.clone(),
            timeout: config.adb_timeout,
            install_timeout: config.install_timeout,
            permits: Arc::new(Semaphore::new(config.adb_max_concurrency.max(1))),
            scratch_dir: config.data_dir.join("logcat"),
        }
    }

    async fn output_within(&self, args: &[&str], limit: Duration) -> Result<Output, ToolError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ToolError::Io("adb command slots closed".into()))?;
        debug!(args = ?args, "adb");
        let mut cmd = Command::new(&self.path);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ToolError::TimedOut(limit)),
        };

        if output.status.success() {
            Ok(output)
        } else {
            Err(ToolError::Exit {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output, ToolError> {
        self.output_within(args, self.timeout).await
    }

    async fn getprops(&self, serial: &str) -> Result<HashMap<String, String>, ToolError> {
        let output = self
            .output_within(&["-s", serial, "shell", "getprop"], PROP_TIMEOUT)
            .await?;
        Ok(parse_getprop(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct AdbListing {
    pub(crate) serial: String,
    pub(crate) state: String,
}

pub(crate) fn parse_adb_devices(output: &str) -> Vec<AdbListing> {
    let mut listings = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") || line.starts_with('*')
        {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        listings.push(AdbListing {
            serial: serial.to_string(),
            state: state.to_string(),
        });
    }

    listings
}

/// Parses `getprop` output lines of the form `[key]: [value]`.
pub(crate) fn parse_getprop(output: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once("]: [") else {
            continue;
        };
        let key = key.trim_start_matches('[');
        let value = value.strip_suffix(']').unwrap_or(value);
        if !key.is_empty() {
            props.insert(key.to_string(), value.to_string());
        }
    }
    props
}

pub(crate) fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn discovered_from_props(serial: &str, props: &HashMap<String, String>) -> DiscoveredDevice {
    let prop = |key: &str| props.get(key).cloned().unwrap_or_default();
    DiscoveredDevice {
        id: normalize_device_id(serial),
        abi: prop("ro.product.cpu.abi"),
        os_version: prop("ro.build.version.release"),
        api_level: prop("ro.build.version.sdk"),
        model: prop("ro.product.model"),
        manufacturer: prop("ro.product.manufacturer"),
    }
}

fn scratch_name(serial: &str) -> String {
    let safe: String = serial
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{safe}-{}.log", Uuid::new_v4())
}

pub(crate) struct AdbBridge {
    adb: Adb,
}

impl AdbBridge {
    pub(crate) fn new(adb: Adb) -> Self {
        Self { adb }
    }
}

#[tonic::async_trait]
impl DeviceBridge for AdbBridge {
    async fn probe(&self) -> Result<Vec<DiscoveredDevice>, ToolError> {
        let output = self.adb.output(&["devices", "-l"]).await?;
        let listings = parse_adb_devices(&String::from_utf8_lossy(&output.stdout));

        let mut devices = Vec::new();
        for listing in listings {
            if listing.state != "device" {
                debug!(device = %listing.serial, state = %listing.state, "skipping device");
                continue;
            }
            let serial = canonicalize_adb_serial(&listing.serial);
            let props = match self.adb.getprops(&serial).await {
                Ok(props) => props,
                Err(err) => {
                    warn!(device = %serial, "failed to read device properties: {err}");
                    HashMap::new()
                }
            };
            devices.push(discovered_from_props(&listing.serial, &props));
        }
        Ok(devices)
    }

    fn tool(&self, device_id: &str) -> Box<dyn DeviceTool> {
        Box::new(AdbDevice {
            adb: self.adb.clone(),
            serial: canonicalize_adb_serial(device_id),
            capture: Mutex::new(None),
        })
    }
}

pub(crate) struct AdbDevice {
    adb: Adb,
    serial: String,
    capture: Mutex<Option<LogCapture>>,
}

impl AdbDevice {
    async fn run(&self, args: &[&str]) -> Result<Output, ToolError> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        self.adb.output(&full).await
    }
}

#[tonic::async_trait]
impl DeviceTool for AdbDevice {
    async fn list_packages(&self) -> Result<Vec<String>, ToolError> {
        let output = self.run(&["shell", "pm", "list", "packages"]).await?;
        Ok(parse_package_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn uninstall(&self, package_id: &str) -> Result<(), ToolError> {
        self.run(&["uninstall", package_id]).await?;
        Ok(())
    }

    async fn install(&self, path: &Path) -> Result<(), ToolError> {
        let path = path.to_string_lossy();
        let args = ["-s", self.serial.as_str(), "install", "-r", path.as_ref()];
        self.adb.output_within(&args, self.adb.install_timeout).await?;
        Ok(())
    }

    async fn launch(&self, package_id: &str, command: Option<&str>) -> Result<(), ToolError> {
        let output = match command {
            Some(command) => {
                let args: Vec<&str> = command.split_whitespace().collect();
                if args.is_empty() {
                    return Err(ToolError::Rejected("launch command is empty".into()));
                }
                self.run(&args).await?
            }
            None => {
                self.run(&[
                    "shell",
                    "monkey",
                    "-p",
                    package_id,
                    "-c",
                    LAUNCHER_CATEGORY,
                    "1",
                ])
                .await?
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("monkey aborted") || stdout.contains("Error:") {
            return Err(ToolError::Rejected(format!(
                "launch rejected by device: {}",
                stdout.trim()
            )));
        }
        Ok(())
    }

    async fn force_stop(&self, package_id: &str) -> Result<(), ToolError> {
        self.run(&["shell", "am", "force-stop", package_id]).await?;
        Ok(())
    }

    async fn start_log_capture(&self) -> Result<(), ToolError> {
        let mut capture = self.capture.lock().await;
        if capture.is_some() {
            return Err(ToolError::Rejected("log capture already running".into()));
        }
        if let Err(err) = self.run(&["logcat", "-c"]).await {
            warn!(device = %self.serial, "failed to clear log buffer: {err}");
        }
        let path = self.adb.scratch_dir.join(scratch_name(&self.serial));
        *capture = Some(LogCapture::start(&self.adb.path, &self.serial, path).await?);
        Ok(())
    }

    async fn stop_log_capture(&self) -> Result<Vec<u8>, ToolError> {
        let capture = self.capture.lock().await.take();
        match capture {
            Some(capture) => capture.stop().await,
            None => Err(ToolError::Rejected("log capture is not running".into())),
        }
    }

    async fn mark(&self, message: &str) {
        if let Err(err) = self.run(&["shell", "log", "-t", MARKER_TAG, message]).await {
            debug!(device = %self.serial, "failed to write log marker: {err}");
        }
    }
}
