//! Engine configuration
//!
//! Loaded from a JSON file and/or environment variables. Every toggle the
//! execution core consumes lives here; defaults match the behavior of a
//! plain interactive run.

use serde::Deserialize;
use std::path::Path;

/// Errors from configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Engine-wide configuration consumed by the execution core
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Static register allocation: keep a fixed subset of guest registers in
    /// host registers while inside JIT code.
    pub sra: bool,
    /// Use the strongest fencing on unaligned-atomic fallbacks.
    pub paranoid_tso: bool,
    /// Half-barrier TSO loads/stores in the memory lowering.
    pub half_barrier_tso: bool,
    /// Block all signals around any path that may allocate (front-end
    /// compiles, exit-function linking).
    pub signal_safe_compile: bool,
    /// Non-zero switches block prologues into the single-step pause check.
    pub running_mode: u32,
    /// Size of the guest virtual address space covered by the lookup cache.
    pub virtual_memory_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sra: true,
            paranoid_tso: false,
            half_barrier_tso: false,
            signal_safe_compile: true,
            running_mode: 0,
            virtual_memory_size: 1 << 36,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v != "0" && !v.is_empty())
}

impl EngineConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = serde_json::from_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = EngineConfig::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_flag("MIMIC_SRA").or_else(|| env_flag("MIMIC_STATIC_REGISTER_ALLOCATION")) {
            self.sra = v;
        }
        if let Some(v) = env_flag("MIMIC_PARANOID_TSO") {
            self.paranoid_tso = v;
        }
        if let Some(v) = env_flag("MIMIC_HALF_BARRIER_TSO") {
            self.half_barrier_tso = v;
        }
        if let Some(v) = env_flag("MIMIC_SIGNAL_SAFE_COMPILE") {
            self.signal_safe_compile = v;
        }
    }
}
