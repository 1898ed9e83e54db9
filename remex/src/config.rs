use std::time::Duration;

/// Default port an agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 8333;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// interval between scheduler passes over the workers
    schedule_interval: Duration,
    /// number of connection attempts before a connect fails
    connect_retries: usize,
    /// spacing between connection attempts
    connect_retry_interval: Duration,
    /// number of handshake read attempts before a task fails
    handshake_retries: usize,
    /// spacing between handshake attempts
    handshake_retry_interval: Duration,
    /// interval between agent process-table sweeps
    process_clean_interval: Duration,
    /// whether the cluster syncs the driver's current directory on startup
    sync_current_dir: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_millis(100),
            connect_retries: 10,
            connect_retry_interval: Duration::from_secs(1),
            handshake_retries: 5,
            handshake_retry_interval: Duration::from_millis(500),
            process_clean_interval: Duration::from_secs(5),
            sync_current_dir: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn schedule_interval(&self) -> Duration {
        self.schedule_interval
    }

    pub fn set_schedule_interval(&mut self, interval: Duration) {
        self.schedule_interval = interval;
    }

    pub fn connect_retries(&self) -> usize {
        self.connect_retries
    }

    pub fn set_connect_retries(&mut self, retries: usize) {
        self.connect_retries = retries;
    }

    pub fn connect_retry_interval(&self) -> Duration {
        self.connect_retry_interval
    }

    pub fn set_connect_retry_interval(&mut self, interval: Duration) {
        self.connect_retry_interval = interval;
    }

    pub fn handshake_retries(&self) -> usize {
        self.handshake_retries
    }

    pub fn set_handshake_retries(&mut self, retries: usize) {
        self.handshake_retries = retries;
    }

    pub fn handshake_retry_interval(&self) -> Duration {
        self.handshake_retry_interval
    }

    pub fn set_handshake_retry_interval(&mut self, interval: Duration) {
        self.handshake_retry_interval = interval;
    }

    pub fn process_clean_interval(&self) -> Duration {
        self.process_clean_interval
    }

    pub fn set_process_clean_interval(&mut self, interval: Duration) {
        self.process_clean_interval = interval;
    }

    pub fn sync_current_dir(&self) -> bool {
        self.sync_current_dir
    }

    pub fn set_sync_current_dir(&mut self, sync: bool) {
        self.sync_current_dir = sync;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new();
        assert_eq!(config.connect_retries(), 10);
        assert_eq!(config.connect_retry_interval(), Duration::from_secs(1));
        assert_eq!(config.handshake_retries(), 5);
        assert!(!config.sync_current_dir());
    }

    #[test]
    fn setters() {
        let mut config = Config::new();
        config.set_schedule_interval(Duration::from_millis(10));
        config.set_sync_current_dir(true);
        assert_eq!(config.schedule_interval(), Duration::from_millis(10));
        assert!(config.sync_current_dir());
    }
}
