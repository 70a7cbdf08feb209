use vts_proto::vts::v1::{Architecture, Device, LockState as ProtoLockState};

/// Maps `ro.product.cpu.abi` to the coarse architecture used for selection.
pub(crate) fn architecture_from_abi(abi: &str) -> Architecture {
    match abi.trim() {
        "arm64-v8a" => Architecture::Arm64,
        "armeabi-v7a" | "armeabi" => Architecture::Arm32,
        "x86" => Architecture::X86,
        "x86_64" => Architecture::X8664,
        _ => Architecture::Unknown,
    }
}

/// What one discovery probe learned about an attached device.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DiscoveredDevice {
    pub(crate) id: String,
    pub(crate) abi: String,
    pub(crate) os_version: String,
    pub(crate) api_level: String,
    pub(crate) model: String,
    pub(crate) manufacturer: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LockState {
    Available,
    Locked { owner: String, since_millis: i64 },
}

impl LockState {
    pub(crate) fn owner(&self) -> Option<&str> {
        match self {
            LockState::Available => None,
            LockState::Locked { owner, .. } => Some(owner),
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked { .. })
    }
}

/// Registry record for one attached device.
#[derive(Clone, Debug)]
pub(crate) struct DeviceHandle {
    pub(crate) id: String,
    pub(crate) architecture: Architecture,
    pub(crate) abi: String,
    pub(crate) os_version: String,
    pub(crate) api_level: String,
    pub(crate) model: String,
    pub(crate) manufacturer: String,
    pub(crate) lock: LockState,
    pub(crate) last_seen_millis: i64,
    pub(crate) reachable: bool,
}

impl DeviceHandle {
    pub(crate) fn from_discovery(found: &DiscoveredDevice, now: i64) -> Self {
        let mut handle = Self {
            id: found.id.clone(),
            architecture: Architecture::Unknown,
            abi: String::new(),
            os_version: String::new(),
            api_level: String::new(),
            model: String::new(),
            manufacturer: String::new(),
            lock: LockState::Available,
            last_seen_millis: now,
            reachable: true,
        };
        handle.refresh(found, now);
        handle
    }

    /// Updates probe-derived fields in place; the lock is never touched here.
    pub(crate) fn refresh(&mut self, found: &DiscoveredDevice, now: i64) {
        self.architecture = architecture_from_abi(&found.abi);
        self.abi = found.abi.clone();
        self.os_version = found.os_version.clone();
        self.api_level = found.api_level.clone();
        self.model = found.model.clone();
        self.manufacturer = found.manufacturer.clone();
        self.last_seen_millis = now;
        self.reachable = true;
    }

    pub(crate) fn to_proto(&self) -> Device {
        let (lock_state, owner_token) = match &self.lock {
            LockState::Available => (ProtoLockState::Available, String::new()),
            LockState::Locked { owner, .. } => (ProtoLockState::Locked, owner.clone()),
        };
        Device {
            device_id: self.id.clone(),
            agent: String::new(),
            selector: String::new(),
            architecture: self.architecture as i32,
            abi: self.abi.clone(),
            os_version: self.os_version.clone(),
            api_level: self.api_level.clone(),
            model: self.model.clone(),
            manufacturer: self.manufacturer.clone(),
            lock_state: lock_state as i32,
            owner_token,
            last_seen_unix_millis: self.last_seen_millis,
            reachable: self.reachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_mapping_covers_known_families() {
        assert_eq!(architecture_from_abi("arm64-v8a"), Architecture::Arm64);
        assert_eq!(architecture_from_abi("armeabi-v7a"), Architecture::Arm32);
        assert_eq!(architecture_from_abi("x86_64"), Architecture::X8664);
        assert_eq!(architecture_from_abi("x86"), Architecture::X86);
        assert_eq!(architecture_from_abi("mips"), Architecture::Unknown);
        assert_eq!(architecture_from_abi(""), Architecture::Unknown);
    }

    #[test]
    fn owner_token_only_present_when_locked() {
        let found = DiscoveredDevice {
            id: "emulator-5554".into(),
            abi: "x86_64".into(),
            ..Default::default()
        };
        let mut handle = DeviceHandle::from_discovery(&found, 10);
        let proto = handle.to_proto();
        assert_eq!(proto.lock_state, ProtoLockState::Available as i32);
        assert!(proto.owner_token.is_empty());

        handle.lock = LockState::Locked {
            owner: "t0".into(),
            since_millis: 11,
        };
        let proto = handle.to_proto();
        assert_eq!(proto.lock_state, ProtoLockState::Locked as i32);
        assert_eq!(proto.owner_token, "t0");
    }
}
