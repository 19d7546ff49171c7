//! Sortable identifiers and timestamps

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Id prefixes for each record kind
pub mod prefix {
    pub const SESSION: &str = "ses";
    pub const MESSAGE: &str = "msg";
    pub const PART: &str = "prt";
    pub const PERMISSION: &str = "per";
    pub const TOOL: &str = "tool";
}

/// Generate an id whose lexicographic order follows creation order within
/// this process: `{prefix}_{millis-hex}{counter-hex}{random}`.
pub fn ascending(prefix: &str) -> String {
    let millis = now().max(0) as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0xff_ffff;
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{millis:012x}{count:06x}{}", &random[..8])
}

/// Milliseconds since the Unix epoch
pub fn now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
