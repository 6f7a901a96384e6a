use serde::{Deserialize, Serialize};

/// Runtime knobs for the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Emit per-element `trace` events for every decoded argument.
    pub trace_arguments: bool,
    /// Maximum number of elements dumped per array when tracing.
    pub trace_limit: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            trace_arguments: false,
            trace_limit: 16,
        }
    }
}

impl BridgeSettings {
    pub const TRACE_ARGUMENTS_ENV: &'static str = "DIFFCALL_TRACE_ARGUMENTS";
    pub const TRACE_LIMIT_ENV: &'static str = "DIFFCALL_TRACE_LIMIT";

    /// Defaults overridden by `DIFFCALL_TRACE_ARGUMENTS` and `DIFFCALL_TRACE_LIMIT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(value) = lookup(Self::TRACE_ARGUMENTS_ENV) {
            settings.trace_arguments = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(value) = lookup(Self::TRACE_LIMIT_ENV) {
            match value.trim().parse() {
                Ok(limit) => settings.trace_limit = limit,
                Err(_) => tracing::warn!(%value, "ignoring unparsable {}", Self::TRACE_LIMIT_ENV),
            }
        }
        settings
    }
}
