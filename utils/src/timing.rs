// Time helpers for log stamps and frame accounting
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Error getting system time")
}

// Helper to get the current time in milliseconds
pub fn get_current_millis() -> u64 {
    get_current_time().as_millis() as u64
}
