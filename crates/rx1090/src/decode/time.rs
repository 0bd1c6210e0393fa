use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_in_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before unix epoch")
        .as_nanos()
}

/// Wall-clock seconds since the epoch, the timestamp convention used on
/// every decoded message
pub fn now_in_s() -> f64 {
    now_in_ns() as f64 * 1e-9
}
