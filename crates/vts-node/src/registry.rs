//! Device registry and lock manager for the devices attached to this host.
//!
//! Each handle sits behind its own mutex so unrelated devices never contend;
//! the outer map lock is only held long enough to find or insert an entry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vts_proto::vts::v1::Architecture;
use vts_util::now_millis;

use crate::device::{DeviceHandle, DiscoveredDevice, LockState};
use crate::ids::normalize_device_id;
use crate::tool::{DeviceBridge, ToolError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum LockError {
    #[error("device {0} is not known to this host")]
    NotFound(String),
    #[error("device {device_id} is locked by another owner")]
    LockConflict { device_id: String },
    #[error("device {0} is locked by a different owner token")]
    NotOwner(String),
    #[error("device {0} is not locked")]
    NotLocked(String),
    #[error("timed out waiting for device {0}")]
    TimedOut(String),
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ListFilter {
    /// Empty matches every architecture.
    pub(crate) architectures: Vec<Architecture>,
    /// Zero means no cap.
    pub(crate) amount: usize,
    pub(crate) include_unreachable: bool,
}

impl ListFilter {
    fn matches(&self, handle: &DeviceHandle) -> bool {
        if !self.include_unreachable && !handle.reachable {
            return false;
        }
        self.architectures.is_empty() || self.architectures.contains(&handle.architecture)
    }
}

type Entry = Arc<Mutex<DeviceHandle>>;

pub(crate) struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
    bridge: Arc<dyn DeviceBridge>,
    lock_wait: Duration,
}

impl Registry {
    pub(crate) fn new(bridge: Arc<dyn DeviceBridge>, lock_wait: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bridge,
            lock_wait,
        }
    }

    pub(crate) fn default_lock_wait(&self) -> Duration {
        self.lock_wait
    }

    async fn entry(&self, device_id: &str) -> Option<Entry> {
        let key = normalize_device_id(device_id);
        self.entries.read().await.get(&key).cloned()
    }

    /// Re-probes attached devices and upserts them. Handles the probe did not
    /// see are marked unreachable but keep their lock; a failed probe leaves
    /// the registry untouched.
    pub(crate) async fn discover(&self) -> Result<Vec<DeviceHandle>, ToolError> {
        let found = self.bridge.probe().await?;
        self.apply_discovery(found).await;
        Ok(self
            .list(&ListFilter {
                include_unreachable: true,
                ..Default::default()
            })
            .await)
    }

    async fn apply_discovery(&self, found: Vec<DiscoveredDevice>) {
        let now = now_millis();
        let mut seen: HashMap<String, DiscoveredDevice> = HashMap::new();
        for mut device in found {
            let key = normalize_device_id(&device.id);
            if key.is_empty() {
                continue;
            }
            device.id = key.clone();
            seen.insert(key, device);
        }

        let mut fresh = Vec::new();
        let existing: Vec<(String, Entry)> = {
            let mut entries = self.entries.write().await;
            for (key, device) in &seen {
                if !entries.contains_key(key) {
                    let handle = DeviceHandle::from_discovery(device, now);
                    entries.insert(key.clone(), Arc::new(Mutex::new(handle)));
                    fresh.push(key.clone());
                }
            }
            entries
                .iter()
                .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
                .collect()
        };
        for key in fresh {
            info!(device = %key, "device discovered");
        }

        for (key, entry) in existing {
            let mut handle = entry.lock().await;
            match seen.get(&key) {
                Some(device) => {
                    if !handle.reachable {
                        info!(device = %key, "device reachable again");
                    }
                    handle.refresh(device, now);
                }
                None if handle.reachable => {
                    handle.reachable = false;
                    if let Some(owner) = handle.lock.owner() {
                        warn!(device = %key, owner = %owner, "locked device missing from discovery");
                    } else {
                        info!(device = %key, "device no longer reachable");
                    }
                }
                None => {}
            }
        }
    }

    /// Read-only listing sorted by device id.
    pub(crate) async fn list(&self, filter: &ListFilter) -> Vec<DeviceHandle> {
        let entries: Vec<Entry> = self.entries.read().await.values().cloned().collect();
        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            let handle = entry.lock().await;
            if filter.matches(&handle) {
                handles.push(handle.clone());
            }
        }
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        if filter.amount > 0 {
            handles.truncate(filter.amount);
        }
        handles
    }

    pub(crate) async fn get(&self, device_id: &str) -> Option<DeviceHandle> {
        let entry = self.entry(device_id).await?;
        let handle = entry.lock().await;
        Some(handle.clone())
    }

    /// Succeeds only if the device exists and is available. Waiting on the
    /// entry is bounded; running out of time counts as a conflict.
    pub(crate) async fn acquire(
        &self,
        device_id: &str,
        owner_token: &str,
        wait: Duration,
    ) -> Result<DeviceHandle, LockError> {
        let entry = self
            .entry(device_id)
            .await
            .ok_or_else(|| LockError::NotFound(device_id.to_string()))?;
        let mut handle = tokio::time::timeout(wait, entry.lock())
            .await
            .map_err(|_| LockError::TimedOut(device_id.to_string()))?;
        match handle.lock {
            LockState::Available => {
                handle.lock = LockState::Locked {
                    owner: owner_token.to_string(),
                    since_millis: now_millis(),
                };
                debug!(device = %handle.id, owner = %owner_token, "device locked");
                Ok(handle.clone())
            }
            LockState::Locked { .. } => Err(LockError::LockConflict {
                device_id: handle.id.clone(),
            }),
        }
    }

    pub(crate) async fn release(&self, device_id: &str, owner_token: &str) -> Result<(), LockError> {
        let entry = self
            .entry(device_id)
            .await
            .ok_or_else(|| LockError::NotFound(device_id.to_string()))?;
        let mut handle = entry.lock().await;
        let current = handle.lock.owner().map(str::to_string);
        match current {
            None => Err(LockError::NotLocked(handle.id.clone())),
            Some(owner) if owner != owner_token => Err(LockError::NotOwner(handle.id.clone())),
            Some(_) => {
                handle.lock = LockState::Available;
                debug!(device = %handle.id, owner = %owner_token, "device released");
                Ok(())
            }
        }
    }

    /// Administrative release that ignores the owner. Returns the previous
    /// owner token, if the device was locked.
    pub(crate) async fn release_forced(&self, device_id: &str) -> Result<Option<String>, LockError> {
        let entry = self
            .entry(device_id)
            .await
            .ok_or_else(|| LockError::NotFound(device_id.to_string()))?;
        let mut handle = entry.lock().await;
        let previous = std::mem::replace(&mut handle.lock, LockState::Available);
        match previous {
            LockState::Locked { owner, .. } => {
                info!(device = %handle.id, previous_owner = %owner, "device force released");
                Ok(Some(owner))
            }
            LockState::Available => Ok(None),
        }
    }
}
