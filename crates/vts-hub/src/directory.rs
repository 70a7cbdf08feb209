//! Which devices each host agent owns, as of the last discovery pass.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use vts_proto::vts::v1::ListDevicesRequest;

use crate::agents::AgentClient;

/// A caller-facing device reference, `<device_id>_<agent>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Selector {
    pub(crate) device_id: String,
    pub(crate) agent: String,
}

impl Selector {
    /// Agent names never contain `_`, device ids may. Agent names are
    /// matched case-insensitively, like the agent configuration.
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let (device_id, agent) = raw.trim().rsplit_once('_')?;
        if device_id.is_empty() || agent.is_empty() {
            return None;
        }
        Some(Self {
            device_id: device_id.to_string(),
            agent: agent.to_ascii_lowercase(),
        })
    }

    pub(crate) fn format(device_id: &str, agent: &str) -> String {
        format!("{device_id}_{agent}")
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.device_id, self.agent)
    }
}

pub(crate) struct Directory {
    agents: Vec<Arc<dyn AgentClient>>,
    known: RwLock<HashMap<String, HashSet<String>>>,
}

impl Directory {
    pub(crate) fn new(agents: Vec<Arc<dyn AgentClient>>) -> Self {
        Self {
            agents,
            known: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn agents(&self) -> &[Arc<dyn AgentClient>] {
        &self.agents
    }

    pub(crate) fn agent(&self, name: &str) -> Option<Arc<dyn AgentClient>> {
        self.agents
            .iter()
            .find(|agent| agent.name() == name)
            .cloned()
    }

    /// Asks every agent to re-probe. An agent that does not answer keeps the
    /// device set it reported last.
    pub(crate) async fn refresh(&self) {
        let request = ListDevicesRequest {
            architectures: Vec::new(),
            amount: 0,
            refresh: true,
            include_unreachable: true,
        };
        let listings = join_all(self.agents.iter().map(|agent| {
            let request = request.clone();
            async move { (agent.name().to_string(), agent.list_devices(request).await) }
        }))
        .await;

        let mut known = self.known.write().await;
        for (agent, listing) in listings {
            match listing {
                Ok(devices) => {
                    let ids: HashSet<String> = devices.into_iter().map(|d| d.device_id).collect();
                    debug!(agent = %agent, devices = ids.len(), "agent discovery");
                    known.insert(agent, ids);
                }
                Err(err) => warn!(agent = %agent, "discovery failed: {err}"),
            }
        }
    }

    async fn knows(&self, selector: &Selector) -> bool {
        if self.agent(&selector.agent).is_none() {
            return false;
        }
        self.known
            .read()
            .await
            .get(&selector.agent)
            .map(|ids| ids.contains(&selector.device_id))
            .unwrap_or(false)
    }

    /// Returns the selectors no agent owns. A miss triggers one refresh
    /// before the selector is reported unknown.
    pub(crate) async fn unknown(&self, selectors: &[Selector]) -> Vec<Selector> {
        let mut missing = Vec::new();
        for selector in selectors {
            if !self.knows(selector).await {
                missing.push(selector.clone());
            }
        }
        if missing.is_empty() {
            return missing;
        }

        info!(missing = missing.len(), "unknown devices requested, refreshing directory");
        self.refresh().await;
        let mut still_missing = Vec::new();
        for selector in missing {
            if !self.knows(&selector).await {
                still_missing.push(selector);
            }
        }
        still_missing
    }
}

pub(crate) fn spawn_discovery(directory: Arc<Directory>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            directory.refresh().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::FakeAgent;

    #[test]
    fn selectors_split_on_the_last_underscore() {
        assert_eq!(
            Selector::parse("emulator-5554_rack1"),
            Some(Selector {
                device_id: "emulator-5554".into(),
                agent: "rack1".into()
            })
        );
        assert_eq!(
            Selector::parse("odd_serial_rack2").map(|s| s.device_id),
            Some("odd_serial".to_string())
        );
        assert_eq!(Selector::parse("no-agent"), None);
        assert_eq!(Selector::parse("_rack1"), None);
        assert_eq!(Selector::parse("d1_"), None);
        assert_eq!(Selector::format("d1", "rack1"), "d1_rack1");
    }

    #[tokio::test]
    async fn selector_agent_names_ignore_case() {
        let selector = Selector::parse("Emulator-5554_Rack1").unwrap();
        assert_eq!(selector.device_id, "Emulator-5554");
        assert_eq!(selector.agent, "rack1");

        let rack1 = FakeAgent::new("rack1", &["d1"]);
        let directory = Directory::new(vec![rack1 as Arc<dyn AgentClient>]);
        assert!(directory
            .unknown(&[Selector::parse("d1_RACK1").unwrap()])
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_devices_trigger_one_refresh() {
        let rack1 = FakeAgent::new("rack1", &["d1"]);
        let directory = Directory::new(vec![rack1.clone() as Arc<dyn AgentClient>]);

        // Never refreshed: the first lookup refreshes and then finds d1.
        let missing = directory
            .unknown(&[
                Selector::parse("d1_rack1").unwrap(),
                Selector::parse("d9_rack1").unwrap(),
                Selector::parse("d1_rack7").unwrap(),
            ])
            .await;
        assert_eq!(
            missing,
            [
                Selector::parse("d9_rack1").unwrap(),
                Selector::parse("d1_rack7").unwrap()
            ]
        );
        assert_eq!(rack1.count("list"), 1);

        assert!(directory
            .unknown(&[Selector::parse("d1_rack1").unwrap()])
            .await
            .is_empty());
        assert_eq!(rack1.count("list"), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_last_known_devices() {
        let rack1 = FakeAgent::new("rack1", &["d1"]);
        let directory = Directory::new(vec![rack1.clone() as Arc<dyn AgentClient>]);
        directory.refresh().await;

        rack1.set_unreachable(true);
        directory.refresh().await;
        assert!(directory
            .unknown(&[Selector::parse("d1_rack1").unwrap()])
            .await
            .is_empty());
    }
}
