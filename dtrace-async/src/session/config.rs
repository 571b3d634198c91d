//! Session configuration

/// Default number of worker threads executing control operations
pub const DEFAULT_WORKERS: usize = 4;

/// Default principal and aggregation buffer sizes
pub const DEFAULT_BUFSIZE: &str = "4m";
pub const DEFAULT_AGGSIZE: &str = "4m";

/// Options applied right after a connection opens, and the worker pool size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Engine options in application order; `None` sets a boolean option
    pub options: Vec<(String, Option<String>)>,
    pub workers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            options: vec![
                ("bufsize".to_string(), Some(DEFAULT_BUFSIZE.to_string())),
                ("aggsize".to_string(), Some(DEFAULT_AGGSIZE.to_string())),
            ],
            workers: DEFAULT_WORKERS,
        }
    }
}

impl SessionConfig {
    /// Set an open-time option, replacing an earlier value for the same name
    #[must_use]
    pub fn with_option(mut self, option: &str, value: Option<&str>) -> Self {
        let value = value.map(str::to_string);
        match self.options.iter_mut().find(|(name, _)| name == option) {
            Some(existing) => existing.1 = value,
            None => self.options.push((option.to_string(), value)),
        }
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}
