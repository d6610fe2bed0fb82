use std::time::Duration;

/// How many times is a remote command or transfer attempted before it fails.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Exit code used by `ssh` to signal a connection failure.
pub const SSH_TRANSPORT_FAULT: i32 = 255;

/// Length of the random suffix of remote job directories.
pub const REMOTE_DIR_SUFFIX_LENGTH: usize = 5;

/// Number of consecutive status/staging failures of a job after which the job's
/// failures are logged as errors instead of warnings.
pub const ERROR_REPORT_THRESHOLD: u32 = 3;

pub fn get_retry_attempts() -> u32 {
    std::env::var("HPCB_RETRY_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|attempts| *attempts > 0)
        .unwrap_or(DEFAULT_RETRY_ATTEMPTS)
}

/// Delay between two attempts of a failed remote call.
pub fn get_retry_backoff() -> Duration {
    get_duration_from_env("HPCB_RETRY_BACKOFF_MS").unwrap_or_else(|| Duration::from_secs(10))
}

/// Lower bound of the time between two iterations of the monitor loop.
pub fn get_min_tick() -> Duration {
    get_duration_from_env("HPCB_MIN_TICK_MS").unwrap_or_else(|| Duration::from_secs(1))
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
