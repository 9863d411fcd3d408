use chrono::{DateTime, Utc};

/// Wall-clock source for cache stamps and debug dump names.
///
/// Timeouts use `tokio::time` instead, so tests can pause them.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since the Unix epoch, as stored in the token cache.
    fn unix_timestamp(&self) -> i64 {
        self.now().timestamp()
    }

    /// Sortable, filesystem-safe stamp (`2024-05-01-13-45-10`).
    fn file_stamp(&self) -> String {
        self.now().format("%Y-%m-%d-%H-%M-%S").to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
