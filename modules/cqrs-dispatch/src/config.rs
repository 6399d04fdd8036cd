use anyhow::{Context, Result};

use crate::manager::ListenOptions;

/// Listen settings loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub exclusive: bool,
    pub listener_count: usize,
    pub channel_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let options = ListenOptions::default();
        Self {
            exclusive: options.exclusive,
            listener_count: options.listener_count,
            channel_capacity: options.channel_capacity,
        }
    }
}

impl DispatchConfig {
    /// Load from `DISPATCH_*` variables (and `.env` if present). Unset
    /// variables take their defaults; unparseable values are errors.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            exclusive: parse_or(&lookup, "DISPATCH_EXCLUSIVE", defaults.exclusive)?,
            listener_count: parse_or(&lookup, "DISPATCH_LISTENER_COUNT", defaults.listener_count)?,
            channel_capacity: parse_or(
                &lookup,
                "DISPATCH_CHANNEL_CAPACITY",
                defaults.channel_capacity,
            )?,
        })
    }

    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            exclusive: self.exclusive,
            listener_count: self.listener_count,
            channel_capacity: self.channel_capacity,
        }
    }

    pub fn log(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  DISPATCH_EXCLUSIVE: {}", self.exclusive);
        tracing::info!("  DISPATCH_LISTENER_COUNT: {}", self.listener_count);
        tracing::info!("  DISPATCH_CHANNEL_CAPACITY: {}", self.channel_capacity);
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        _ => Ok(default),
    }
}
