use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tonic::transport::Channel;
use vts_proto::vts::v1::{
    execute_chunk::Payload, hub_service_client::HubServiceClient,
    node_service_client::NodeServiceClient, Architecture, Device, ExecuteChunk, ExecuteHeader,
    ForceReleaseDeviceRequest, HubListDevicesRequest, ListDevicesRequest, LockState, RunStatus,
};
use vts_util::{connect_channel, hub_addr, node_addr, split_chunks, MAX_MESSAGE_BYTES};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "vts-cli", version, about = "Android device pool CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List devices across every host agent (HubService)
    Devices {
        #[arg(long, default_value_t = hub_addr())]
        hub: String,
        #[command(flatten)]
        filter: ArchFilter,
        /// Return at most this many devices, 0 for all
        #[arg(long, default_value_t = 0)]
        amount: u32,
        #[arg(long)]
        json: bool,
    },
    /// Install, run and tear down a package on the selected devices
    Execute {
        #[arg(long, default_value_t = hub_addr())]
        hub: String,
        /// .apk or .aab to run
        #[arg(long)]
        file: PathBuf,
        /// Comma separated `<device_id>_<agent>` selectors
        #[arg(long, value_delimiter = ',', required = true)]
        devices: Vec<String>,
        /// Execution time in seconds
        #[arg(long)]
        time: u32,
        /// Skip signing the package
        #[arg(long)]
        no_sign: bool,
        /// Replaces the default launcher intent, passed to adb after `-s <serial>`
        #[arg(long)]
        launch_cmd: Option<String>,
        /// Directory that receives one log file per device
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Talk to a single host agent directly (NodeService)
    Node {
        #[command(subcommand)]
        cmd: NodeCmd,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    /// List the devices attached to one host
    Devices {
        #[arg(long, default_value_t = node_addr())]
        node: String,
        /// Re-probe attached devices first
        #[arg(long)]
        refresh: bool,
        /// Include devices discovery no longer sees
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Release a device lock regardless of its owner
    ForceRelease {
        #[arg(long, default_value_t = node_addr())]
        node: String,
        device_id: String,
    },
}

#[derive(Args)]
struct ArchFilter {
    #[arg(long)]
    arm64: bool,
    #[arg(long)]
    arm32: bool,
    #[arg(long)]
    x86: bool,
    #[arg(long)]
    x86_64: bool,
}

impl ArchFilter {
    fn values(&self) -> Vec<i32> {
        [
            (self.arm64, Architecture::Arm64),
            (self.arm32, Architecture::Arm32),
            (self.x86, Architecture::X86),
            (self.x86_64, Architecture::X8664),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .map(|(_, arch)| arch as i32)
        .collect()
    }
}

#[derive(Serialize)]
struct DeviceRow {
    selector: String,
    agent: String,
    device_id: String,
    architecture: String,
    abi: String,
    os_version: String,
    api_level: String,
    model: String,
    manufacturer: String,
    locked: bool,
    owner_token: String,
    reachable: bool,
}

impl From<Device> for DeviceRow {
    fn from(device: Device) -> Self {
        let architecture = Architecture::try_from(device.architecture)
            .unwrap_or(Architecture::Unknown)
            .as_str_name()
            .trim_start_matches("ARCHITECTURE_")
            .to_ascii_lowercase();
        Self {
            selector: device.selector,
            agent: device.agent,
            device_id: device.device_id,
            architecture,
            abi: device.abi,
            os_version: device.os_version,
            api_level: device.api_level,
            model: device.model,
            manufacturer: device.manufacturer,
            locked: device.lock_state == LockState::Locked as i32,
            owner_token: device.owner_token,
            reachable: device.reachable,
        }
    }
}

fn print_devices(devices: Vec<Device>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let rows: Vec<DeviceRow> = devices.into_iter().map(DeviceRow::from).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in rows {
        let name = if row.selector.is_empty() {
            &row.device_id
        } else {
            &row.selector
        };
        let lock = if row.locked {
            format!("locked({})", row.owner_token)
        } else {
            "available".to_string()
        };
        let reach = if row.reachable { "" } else { "\tunreachable" };
        println!(
            "{name}\t{}\tandroid {}\t{} {}\t{lock}{reach}",
            row.architecture, row.os_version, row.manufacturer, row.model
        );
    }
    Ok(())
}

/// Log file name for one device; selectors may carry `:` from network serials.
fn log_file_name(device_id: &str, agent: &str) -> String {
    let name: String = format!("{device_id}_{agent}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    format!("{name}.log")
}

fn execute_chunks(header: ExecuteHeader, package: &[u8]) -> Vec<ExecuteChunk> {
    let mut chunks = vec![ExecuteChunk {
        payload: Some(Payload::Header(header)),
    }];
    chunks.extend(split_chunks(package).into_iter().map(|data| ExecuteChunk {
        payload: Some(Payload::Data(data)),
    }));
    chunks
}

async fn execute(
    hub: &str,
    file: &Path,
    devices: Vec<String>,
    time: u32,
    sign: bool,
    launch_cmd: Option<String>,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let package = tokio::fs::read(file)
        .await
        .map_err(|e| format!("read {}: {e}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();
    let header = ExecuteHeader {
        file_name,
        device_selectors: devices,
        execution_time_secs: time,
        sign,
        launch_command: launch_cmd.unwrap_or_default(),
    };

    let mut client = HubServiceClient::new(connect(hub).await?)
        .max_decoding_message_size(MAX_MESSAGE_BYTES)
        .max_encoding_message_size(MAX_MESSAGE_BYTES);
    let resp = client
        .execute(tokio_stream::iter(execute_chunks(header, &package)))
        .await?
        .into_inner();

    tokio::fs::create_dir_all(out).await?;
    let mut failed = 0;
    for result in resp.results {
        let status = RunStatus::try_from(result.status).unwrap_or(RunStatus::Unspecified);
        if status != RunStatus::Success {
            failed += 1;
        }
        let mut line = format!(
            "{}_{}\t{}",
            result.device_id,
            result.agent,
            status.as_str_name().trim_start_matches("RUN_STATUS_")
        );
        if !result.log_payload.is_empty() {
            let path = out.join(log_file_name(&result.device_id, &result.agent));
            tokio::fs::write(&path, &result.log_payload).await?;
            line.push_str(&format!("\tlog={}", path.display()));
        }
        if !result.error_detail.is_empty() {
            line.push_str(&format!("\t{}", result.error_detail));
        }
        println!("{line}");
        for warning in result.cleanup_warnings {
            println!("\twarning: {warning}");
        }
    }
    if failed > 0 {
        return Err(format!("{failed} device(s) did not succeed").into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    vts_util::load_dotenv();
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Devices {
            hub,
            filter,
            amount,
            json,
        } => {
            let mut client = HubServiceClient::new(connect(&hub).await?);
            let resp = client
                .list_devices(HubListDevicesRequest {
                    architectures: filter.values(),
                    amount,
                })
                .await?
                .into_inner();
            print_devices(resp.devices, json)?;
        }
        Cmd::Execute {
            hub,
            file,
            devices,
            time,
            no_sign,
            launch_cmd,
            out,
        } => {
            execute(&hub, &file, devices, time, !no_sign, launch_cmd, &out).await?;
        }
        Cmd::Node { cmd } => match cmd {
            NodeCmd::Devices {
                node,
                refresh,
                all,
                json,
            } => {
                let mut client = NodeServiceClient::new(connect(&node).await?);
                let resp = client
                    .list_devices(ListDevicesRequest {
                        architectures: vec![],
                        amount: 0,
                        refresh,
                        include_unreachable: all,
                    })
                    .await?
                    .into_inner();
                print_devices(resp.devices, json)?;
            }
            NodeCmd::ForceRelease { node, device_id } => {
                let mut client = NodeServiceClient::new(connect(&node).await?);
                let resp = client
                    .force_release_device(ForceReleaseDeviceRequest { device_id })
                    .await?
                    .into_inner();
                if resp.previous_owner.is_empty() {
                    println!("device was not locked");
                } else {
                    println!("released, previous_owner={}", resp.previous_owner);
                }
            }
        },
    }

    Ok(())
}

async fn connect(addr: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    Ok(connect_channel(addr, CONNECT_TIMEOUT)
        .await
        .map_err(|e| format!("connect {addr}: {e}"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_flags_map_to_proto_values() {
        let filter = ArchFilter {
            arm64: true,
            arm32: false,
            x86: false,
            x86_64: true,
        };
        assert_eq!(
            filter.values(),
            [Architecture::Arm64 as i32, Architecture::X8664 as i32]
        );
    }

    #[test]
    fn log_names_are_filesystem_safe() {
        assert_eq!(
            log_file_name("localhost:5555", "rack1"),
            "localhost_5555_rack1.log"
        );
        assert_eq!(log_file_name("emulator-5554", "lab"), "emulator-5554_lab.log");
    }

    #[test]
    fn header_precedes_package_chunks() {
        let chunks = execute_chunks(ExecuteHeader::default(), b"PK");
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[0].payload, Some(Payload::Header(_))));
        assert!(matches!(&chunks[1].payload, Some(Payload::Data(d)) if d == b"PK"));
    }

    #[test]
    fn cli_parses_execute() {
        let cli = Cli::try_parse_from([
            "vts-cli",
            "execute",
            "--file",
            "app.aab",
            "--devices",
            "d1_rack1,d2_rack2",
            "--time",
            "30",
            "--no-sign",
        ])
        .unwrap();
        match cli.cmd {
            Cmd::Execute {
                devices,
                time,
                no_sign,
                ..
            } => {
                assert_eq!(devices, ["d1_rack1", "d2_rack2"]);
                assert_eq!(time, 30);
                assert!(no_sign);
            }
            _ => panic!("expected execute"),
        }
    }
}
