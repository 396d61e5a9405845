use std::fmt;
use std::time::Duration;

pub const DEFAULT_EVENT_CAPACITY: usize = 64;

pub const OPERATION_TIMEOUT_ENV: &str = "TETHER_OPERATION_TIMEOUT_MS";
pub const EVENT_CAPACITY_ENV: &str = "TETHER_EVENT_CAPACITY";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CentralConfig {
    /// Upper bound on every awaited command; `None` waits indefinitely.
    pub operation_timeout: Option<Duration>,
    /// Buffer size of the event and value-update broadcast channels.
    pub event_capacity: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            operation_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl CentralConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(OPERATION_TIMEOUT_ENV) {
            let millis: u64 = parse(OPERATION_TIMEOUT_ENV, &raw)?;
            // Zero disables the timeout rather than failing every command.
            config.operation_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        if let Some(raw) = lookup(EVENT_CAPACITY_ENV) {
            let capacity: usize = parse(EVENT_CAPACITY_ENV, &raw)?;
            if capacity == 0 {
                return Err(ConfigError {
                    var: EVENT_CAPACITY_ENV,
                    value: raw,
                });
            }
            config.event_capacity = capacity;
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError {
        var,
        value: raw.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<_, _> = vars.iter().copied().collect();
        move |var| vars.get(var).map(|v| v.to_string())
    }

    #[test]
    fn defaults_without_env() {
        assert_eq!(CentralConfig::from_lookup(lookup(&[])), Ok(CentralConfig::default()));
    }

    #[test]
    fn reads_timeout_and_capacity() {
        let config = CentralConfig::from_lookup(lookup(&[
            (OPERATION_TIMEOUT_ENV, "250"),
            (EVENT_CAPACITY_ENV, "8"),
        ]))
        .unwrap();
        assert_eq!(config.operation_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.event_capacity, 8);
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = CentralConfig::from_lookup(lookup(&[(OPERATION_TIMEOUT_ENV, "0")])).unwrap();
        assert_eq!(config.operation_timeout, None);
    }

    #[test]
    fn rejects_garbage() {
        let err = CentralConfig::from_lookup(lookup(&[(EVENT_CAPACITY_ENV, "lots")])).unwrap_err();
        assert_eq!(err.var, EVENT_CAPACITY_ENV);
        assert!(CentralConfig::from_lookup(lookup(&[(EVENT_CAPACITY_ENV, "0")])).is_err());
    }
}
