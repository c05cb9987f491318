//! Tuning knobs of a [`crate::MemInfo`] context.

use std::env;

use guestmem_bolts::Error;
use typed_builder::TypedBuilder;

/// Below this size, events are only tracked in detailed mode.
pub const DEFAULT_MIN_TRACKED_SIZE: u32 = 0x100;
/// Pending length above which the background worker is woken.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;
/// Capacity reserved for the pending buffer.
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;

/// Env var enabling detailed tracking from the start
pub const GUESTMEM_DETAILED: &str = "GUESTMEM_DETAILED";
/// Env var overriding [`MemInfoConfig::min_tracked_size`]
pub const GUESTMEM_MIN_TRACKED_SIZE: &str = "GUESTMEM_MIN_TRACKED_SIZE";
/// Env var overriding [`MemInfoConfig::flush_threshold`]
pub const GUESTMEM_FLUSH_THRESHOLD: &str = "GUESTMEM_FLUSH_THRESHOLD";

/// Configuration of a [`crate::MemInfo`] context.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder)]
pub struct MemInfoConfig {
    /// Track every event, not only large ones and writes.
    #[builder(default = false)]
    pub detailed: bool,
    /// Events at least this large are tracked even when not detailed.
    #[builder(default = DEFAULT_MIN_TRACKED_SIZE)]
    pub min_tracked_size: u32,
    /// Pending length above which the worker is signalled.
    #[builder(default = DEFAULT_FLUSH_THRESHOLD)]
    pub flush_threshold: usize,
    /// Capacity reserved for the pending buffer after each flush.
    #[builder(default = DEFAULT_PENDING_CAPACITY)]
    pub pending_capacity: usize,
    /// Spawn the background flush worker.
    #[builder(default = true)]
    pub flush_thread: bool,
}

impl Default for MemInfoConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MemInfoConfig {
    /// The defaults, overridden by any `GUESTMEM_*` env vars that are set.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Ok(value) = env::var(GUESTMEM_DETAILED) {
            config.detailed = parse_switch(GUESTMEM_DETAILED, &value)?;
        }
        if let Ok(value) = env::var(GUESTMEM_MIN_TRACKED_SIZE) {
            config.min_tracked_size = parse_number(&value)?;
        }
        if let Ok(value) = env::var(GUESTMEM_FLUSH_THRESHOLD) {
            config.flush_threshold = parse_number::<u32>(&value)? as usize;
        }
        Ok(config)
    }
}

fn parse_switch(name: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        other => Err(Error::illegal_argument(format!(
            "{name} must be a switch, got `{other}`"
        ))),
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_number<T>(value: &str) -> Result<T, Error>
where
    T: TryFrom<u64>,
{
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => value.parse::<u64>()?,
    };
    T::try_from(parsed)
        .map_err(|_| Error::illegal_argument(format!("{value} is out of range")))
}

#[cfg(test)]
mod tests {
    use std::env;

    use serial_test::serial;

    use super::{
        MemInfoConfig, GUESTMEM_DETAILED, GUESTMEM_FLUSH_THRESHOLD, GUESTMEM_MIN_TRACKED_SIZE,
    };
    use crate::Error;

    fn clear_env() {
        for name in [GUESTMEM_DETAILED, GUESTMEM_MIN_TRACKED_SIZE, GUESTMEM_FLUSH_THRESHOLD] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let config = MemInfoConfig::default();
        assert!(!config.detailed);
        assert_eq!(config.min_tracked_size, 0x100);
        assert_eq!(config.flush_threshold, 1000);
        assert_eq!(config.pending_capacity, 1024);
        assert!(config.flush_thread);

        let config = MemInfoConfig::builder()
            .detailed(true)
            .flush_thread(false)
            .build();
        assert!(config.detailed);
        assert!(!config.flush_thread);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var(GUESTMEM_DETAILED, "on");
        env::set_var(GUESTMEM_MIN_TRACKED_SIZE, "0x40");
        env::set_var(GUESTMEM_FLUSH_THRESHOLD, "250");
        let config = MemInfoConfig::from_env().unwrap();
        clear_env();

        assert!(config.detailed);
        assert_eq!(config.min_tracked_size, 0x40);
        assert_eq!(config.flush_threshold, 250);
    }

    #[test]
    #[serial]
    fn test_from_env_malformed() {
        clear_env();
        env::set_var(GUESTMEM_MIN_TRACKED_SIZE, "lots");
        let err = MemInfoConfig::from_env().unwrap_err();
        clear_env();
        assert!(matches!(err, Error::IllegalArgument(..)));

        env::set_var(GUESTMEM_DETAILED, "maybe");
        let err = MemInfoConfig::from_env().unwrap_err();
        clear_env();
        assert!(matches!(err, Error::IllegalArgument(..)));
    }
}
