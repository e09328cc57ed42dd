use aero_cpu::{AccessPolicy, DEFAULT_MEMORY_CEILING, DEFAULT_MIN_VALID_ADDRESS};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Engine construction parameters.
///
/// The guest memory block is laid out with the stack at the very top and the heap directly
/// below it; everything from `min_valid_address` up to the heap is free for images and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub memory_size: u64,
    pub memory_ceiling: u64,
    pub min_valid_address: u64,
    pub stack_size: u64,
    pub heap_size: u64,
    /// Instructions per run while safety mode is on.
    pub budget: u64,
    pub safety: bool,
    pub policy: AccessPolicy,
    /// Where [`crate::Engine::preload`] places bytes.
    pub load_address: u64,
    pub jit_page_size: usize,
    pub event_capacity: usize,
    /// Emit an event for every retired instruction.
    pub trace_instructions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_size: 16 * MIB,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            min_valid_address: DEFAULT_MIN_VALID_ADDRESS,
            stack_size: MIB,
            heap_size: 4 * MIB,
            budget: 1000,
            safety: true,
            policy: AccessPolicy::Regions,
            load_address: 0x1000,
            jit_page_size: 4096,
            event_capacity: 1024,
            trace_instructions: false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
    #[error("inconsistent engine configuration: {0}")]
    Inconsistent(String),
}

/// Accepts decimal or `0x`-prefixed hexadecimal.
fn parse_u64(raw: &str) -> Option<u64> {
    let raw = raw.trim().replace('_', "");
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

pub fn parse_policy(raw: &str) -> Option<AccessPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "regions" => Some(AccessPolicy::Regions),
        "bounds" => Some(AccessPolicy::Bounds),
        _ => None,
    }
}

impl EngineConfig {
    /// Defaults overlaid with `AERO_DBT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let num = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(name)
                .map(|raw| parse_u64(&raw).ok_or(ConfigError::InvalidEnv(name)))
                .transpose()
        };

        if let Some(v) = num("AERO_DBT_MEMORY_SIZE")? {
            cfg.memory_size = v;
        }
        if let Some(v) = num("AERO_DBT_BUDGET")? {
            cfg.budget = v;
        }
        if let Some(v) = num("AERO_DBT_MIN_ADDRESS")? {
            cfg.min_valid_address = v;
        }
        if let Some(v) = num("AERO_DBT_LOAD_ADDRESS")? {
            cfg.load_address = v;
        }
        if let Some(v) = num("AERO_DBT_STACK_SIZE")? {
            cfg.stack_size = v;
        }
        if let Some(v) = num("AERO_DBT_HEAP_SIZE")? {
            cfg.heap_size = v;
        }
        if let Some(raw) = lookup("AERO_DBT_SAFETY") {
            cfg.safety = parse_bool(&raw).ok_or(ConfigError::InvalidEnv("AERO_DBT_SAFETY"))?;
        }
        if let Some(raw) = lookup("AERO_DBT_TRACE_INSTRUCTIONS") {
            cfg.trace_instructions = parse_bool(&raw)
                .ok_or(ConfigError::InvalidEnv("AERO_DBT_TRACE_INSTRUCTIONS"))?;
        }
        if let Some(raw) = lookup("AERO_DBT_POLICY") {
            cfg.policy = parse_policy(&raw).ok_or(ConfigError::InvalidEnv("AERO_DBT_POLICY"))?;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Inconsistent(msg));
        if self.memory_size > self.memory_ceiling {
            return fail(format!(
                "memory size {:#x} exceeds the ceiling {:#x}",
                self.memory_size, self.memory_ceiling
            ));
        }
        let reserved = self
            .stack_size
            .checked_add(self.heap_size)
            .and_then(|v| v.checked_add(self.min_valid_address));
        if reserved.map_or(true, |r| r > self.memory_size) {
            return fail(format!(
                "stack ({:#x}) and heap ({:#x}) do not fit above {:#x} in {:#x} bytes",
                self.stack_size, self.heap_size, self.min_valid_address, self.memory_size
            ));
        }
        if self.stack_size < 16 {
            return fail("stack must hold at least one 16-byte slot".into());
        }
        if self.load_address < self.min_valid_address {
            return fail(format!(
                "load address {:#x} is below the minimum valid address {:#x}",
                self.load_address, self.min_valid_address
            ));
        }
        if self.jit_page_size == 0 {
            return fail("JIT page size must be non-zero".into());
        }
        if self.event_capacity == 0 {
            return fail("event capacity must be non-zero".into());
        }
        Ok(())
    }

    pub fn stack_base(&self) -> u64 {
        self.memory_size - self.stack_size
    }

    pub fn heap_base(&self) -> u64 {
        self.stack_base() - self.heap_size
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_consistent() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.budget, 1000);
        assert_eq!(cfg.stack_base(), 15 * MIB);
        assert_eq!(cfg.heap_base(), 11 * MIB);
    }

    #[test]
    fn env_overlay_parses_hex_and_flags() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("AERO_DBT_BUDGET", "5"),
            ("AERO_DBT_LOAD_ADDRESS", "0x2000"),
            ("AERO_DBT_SAFETY", "off"),
            ("AERO_DBT_POLICY", "bounds"),
        ]))
        .unwrap();
        assert_eq!(cfg.budget, 5);
        assert_eq!(cfg.load_address, 0x2000);
        assert!(!cfg.safety);
        assert_eq!(cfg.policy, AccessPolicy::Bounds);
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let err = EngineConfig::from_lookup(lookup(&[("AERO_DBT_MEMORY_SIZE", "lots")]));
        assert_eq!(err, Err(ConfigError::InvalidEnv("AERO_DBT_MEMORY_SIZE")));
    }

    #[test]
    fn validate_rejects_oversized_layouts() {
        let cfg = EngineConfig {
            memory_size: 2 * MIB,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Inconsistent(_))));

        let cfg = EngineConfig {
            memory_size: 512 * MIB,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Inconsistent(_))));
    }
}
