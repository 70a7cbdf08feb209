pub(crate) fn normalize_adb_addr(addr: &str) -> String {
    let addr = addr.trim();
    let lower = addr.to_ascii_lowercase();
    for prefix in ["localhost:", "127.0.0.1:", "0.0.0.0:", "[::1]:", "[::]:"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return format!("localhost:{rest}");
        }
    }
    addr.to_string()
}

/// Registry key for a device serial. Network serials collapse their loopback
/// spellings so a device reconnected over `127.0.0.1` keeps its handle.
pub(crate) fn normalize_device_id(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains(':') {
        return normalize_adb_addr(trimmed);
    }
    trimmed.to_string()
}

/// Serial form adb accepts for `-s`.
pub(crate) fn canonicalize_adb_serial(addr: &str) -> String {
    let addr = addr.trim();
    for prefix in ["localhost:", "0.0.0.0:", "[::1]:", "[::]:"] {
        if let Some(rest) = addr.strip_prefix(prefix) {
            return format!("127.0.0.1:{rest}");
        }
    }
    addr.to_string()
}
