use std::{path::PathBuf, time::Duration};

use vts_util::{data_dir, env_millis, env_secs, env_u64};

#[derive(Clone, Debug)]
pub(crate) struct NodeConfig {
    pub(crate) adb_path: PathBuf,
    pub(crate) adb_timeout: Duration,
    pub(crate) install_timeout: Duration,
    pub(crate) adb_max_concurrency: usize,
    pub(crate) lock_wait: Duration,
    pub(crate) data_dir: PathBuf,
    pub(crate) max_execution: Duration,
}

impl NodeConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            adb_path: crate::adb::adb_path(),
            adb_timeout: env_secs("VTS_ADB_TIMEOUT_SECS", 10),
            install_timeout: env_secs("VTS_INSTALL_TIMEOUT_SECS", 120),
            adb_max_concurrency: env_u64("VTS_ADB_MAX_CONCURRENCY", 1) as usize,
            lock_wait: env_millis("VTS_LOCK_WAIT_MILLIS", 500),
            data_dir: data_dir(),
            max_execution: env_secs("VTS_MAX_EXECUTION_SECS", 3600),
        }
    }

    pub(crate) fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }
}
