use std::{path::PathBuf, time::Duration};

use vts_util::{data_dir, env_millis, env_secs, env_string, expand_user};

const AGENT_PREFIX: &str = "VTS_AGENT_";
/// `VTS_AGENT_*` variables that configure agents rather than name one.
const AGENT_SETTINGS: [&str; 1] = ["VTS_AGENT_CONNECT_TIMEOUT_SECS"];

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("no host agents configured; set VTS_AGENT_<NAME>=host:port")]
    NoAgents,
    #[error("agent name {0:?} must be non-empty and must not contain '_'")]
    InvalidAgentName(String),
    #[error("agent {0} has an empty address")]
    EmptyAgentAddr(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AgentEndpoint {
    pub(crate) name: String,
    pub(crate) addr: String,
}

#[derive(Clone, Debug)]
pub(crate) struct PackagingConfig {
    pub(crate) java: PathBuf,
    pub(crate) bundletool_jar: Option<PathBuf>,
    pub(crate) zipalign: PathBuf,
    pub(crate) apksigner: PathBuf,
    pub(crate) aapt2: PathBuf,
    pub(crate) keystore: Option<Keystore>,
    pub(crate) work_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub(crate) struct Keystore {
    pub(crate) file: PathBuf,
    pub(crate) pass: String,
    pub(crate) key_alias: String,
}

impl Keystore {
    /// Arguments shared by bundletool and apksigner.
    pub(crate) fn args(&self) -> Vec<String> {
        vec![
            "--ks".into(),
            self.file.to_string_lossy().to_string(),
            "--ks-pass".into(),
            format!("pass:{}", self.pass),
            "--ks-key-alias".into(),
            self.key_alias.clone(),
        ]
    }
}

#[derive(Clone, Debug)]
pub(crate) struct HubConfig {
    pub(crate) agents: Vec<AgentEndpoint>,
    pub(crate) discovery_interval: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) lock_wait: Duration,
    pub(crate) max_execution: Duration,
    pub(crate) packaging: PackagingConfig,
}

impl HubConfig {
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            agents: agents_from_vars(std::env::vars())?,
            discovery_interval: env_secs("VTS_DISCOVERY_INTERVAL_SECS", 30),
            connect_timeout: env_secs("VTS_AGENT_CONNECT_TIMEOUT_SECS", 5),
            lock_wait: env_millis("VTS_LOCK_WAIT_MILLIS", 500),
            max_execution: env_secs("VTS_MAX_EXECUTION_SECS", 3600),
            packaging: PackagingConfig::from_env(),
        })
    }
}

/// Collects `VTS_AGENT_<NAME>=host:port` pairs, sorted by name.
pub(crate) fn agents_from_vars(
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<Vec<AgentEndpoint>, ConfigError> {
    let mut agents = Vec::new();
    for (key, value) in vars {
        if AGENT_SETTINGS.contains(&key.as_str()) {
            continue;
        }
        let Some(name) = key.strip_prefix(AGENT_PREFIX) else {
            continue;
        };
        let name = name.to_ascii_lowercase();
        if name.is_empty() || name.contains('_') {
            return Err(ConfigError::InvalidAgentName(name));
        }
        let addr = value.trim().to_string();
        if addr.is_empty() {
            return Err(ConfigError::EmptyAgentAddr(name));
        }
        agents.push(AgentEndpoint { name, addr });
    }
    if agents.is_empty() {
        return Err(ConfigError::NoAgents);
    }
    agents.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(agents)
}

impl PackagingConfig {
    fn from_env() -> Self {
        let build_tools = latest_build_tools();
        let tool = |key: &str, name: &str| {
            env_string(key)
                .map(|value| expand_user(&value))
                .or_else(|| {
                    build_tools
                        .as_ref()
                        .map(|dir| dir.join(name))
                        .filter(|path| path.is_file())
                })
                .unwrap_or_else(|| PathBuf::from(name))
        };

        let keystore = match (
            env_string("VTS_KEYSTORE_FILE"),
            env_string("VTS_KEYSTORE_PASS"),
            env_string("VTS_KEYSTORE_KEY_ALIAS"),
        ) {
            (Some(file), Some(pass), Some(key_alias)) => Some(Keystore {
                file: expand_user(&file),
                pass,
                key_alias,
            }),
            _ => None,
        };

        Self {
            java: tool("VTS_JAVA_PATH", "java"),
            bundletool_jar: env_string("VTS_BUNDLETOOL_JAR").map(|value| expand_user(&value)),
            zipalign: tool("VTS_ZIPALIGN_PATH", "zipalign"),
            apksigner: tool("VTS_APKSIGNER_PATH", "apksigner"),
            aapt2: tool("VTS_AAPT2_PATH", "aapt2"),
            keystore,
            work_dir: data_dir().join("hub-work"),
        }
    }
}

/// Newest `build-tools/<version>` directory of the Android SDK, if any.
fn latest_build_tools() -> Option<PathBuf> {
    let sdk_root = env_string("ANDROID_SDK_ROOT").or_else(|| env_string("ANDROID_HOME"))?;
    let entries = std::fs::read_dir(PathBuf::from(sdk_root).join("build-tools")).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .max_by_key(|path| version_key(path))
}

fn version_key(path: &std::path::Path) -> Vec<u64> {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .split(['.', '-'])
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn agents_are_lowercased_and_sorted() {
        let agents = agents_from_vars(vars(&[
            ("PATH", "/usr/bin"),
            ("VTS_AGENT_RACK2", "10.0.0.2:50061"),
            ("VTS_AGENT_Rack1", " 10.0.0.1:50061 "),
            ("VTS_AGENT_CONNECT_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(
            agents,
            [
                AgentEndpoint {
                    name: "rack1".into(),
                    addr: "10.0.0.1:50061".into()
                },
                AgentEndpoint {
                    name: "rack2".into(),
                    addr: "10.0.0.2:50061".into()
                },
            ]
        );
    }

    #[test]
    fn rejects_names_that_break_selectors() {
        assert_eq!(
            agents_from_vars(vars(&[("VTS_AGENT_LAB_A", "h:1")])),
            Err(ConfigError::InvalidAgentName("lab_a".into()))
        );
        assert_eq!(
            agents_from_vars(vars(&[("VTS_AGENT_LAB", "  ")])),
            Err(ConfigError::EmptyAgentAddr("lab".into()))
        );
        assert_eq!(agents_from_vars(vars(&[])), Err(ConfigError::NoAgents));
    }

    #[test]
    fn build_tools_versions_sort_numerically() {
        let mut dirs = vec![
            PathBuf::from("/sdk/build-tools/9.0.0"),
            PathBuf::from("/sdk/build-tools/35.0.0"),
            PathBuf::from("/sdk/build-tools/34.0.0-rc1"),
        ];
        dirs.sort_by_key(|path| version_key(path));
        assert_eq!(dirs.last(), Some(&PathBuf::from("/sdk/build-tools/35.0.0")));
    }
}
