//! Translator configuration.
//!
//! [`JitConfig`] carries every tunable of the runtime. It can be built in code with the
//! builder-style setters or read from `ARMJIT_*` environment variables.

use crate::decoder::ExecutionMode;

/// Default executable arena size (64 MiB).
pub const DEFAULT_ARENA_SIZE: usize = 64 << 20;

/// Default maximum number of guest instructions in one translated block.
pub const DEFAULT_MAX_BLOCK_INSTRUCTIONS: usize = 256;

/// Runtime configuration for a [`crate::cpu::CpuContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Guest instruction set executed by contexts of this CPU.
    pub mode: ExecutionMode,
    /// Bytes of RWX memory reserved for generated code.
    pub arena_size: usize,
    /// Upper bound on guest instructions decoded into one block.
    pub max_block_instructions: usize,
    /// Translate first with the fast tier and re-translate hot code.
    pub tiered: bool,
    /// Calls after which a fast-tier function is queued for re-translation.
    pub rejit_threshold: u64,
    /// Drain the re-translation queue on a background thread.
    pub background_rejit: bool,
    /// Dispatches between two synchronization slow paths.
    pub sync_interval: i32,
    /// Attempts before a translation racing with invalidation is installed anyway.
    pub max_translation_retries: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Aarch64,
            arena_size: DEFAULT_ARENA_SIZE,
            max_block_instructions: DEFAULT_MAX_BLOCK_INSTRUCTIONS,
            tiered: true,
            rejit_threshold: 1000,
            background_rejit: true,
            sync_interval: 1024,
            max_translation_retries: 8,
        }
    }
}

impl JitConfig {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_arena_size(mut self, bytes: usize) -> Self {
        self.arena_size = bytes;
        self
    }

    pub fn with_max_block_instructions(mut self, count: usize) -> Self {
        self.max_block_instructions = count.max(1);
        self
    }

    pub fn with_tiered(mut self, tiered: bool) -> Self {
        self.tiered = tiered;
        self
    }

    pub fn with_rejit_threshold(mut self, calls: u64) -> Self {
        self.rejit_threshold = calls.max(1);
        self
    }

    pub fn with_background_rejit(mut self, background: bool) -> Self {
        self.background_rejit = background;
        self
    }

    pub fn with_sync_interval(mut self, dispatches: i32) -> Self {
        self.sync_interval = dispatches.max(1);
        self
    }

    /// Build a configuration from `ARMJIT_*` environment variables on top of the defaults.
    ///
    /// Recognised variables: `ARMJIT_MODE` (`a64` or `a32`), `ARMJIT_ARENA_SIZE`,
    /// `ARMJIT_MAX_BLOCK`, `ARMJIT_TIERED`, `ARMJIT_REJIT_THRESHOLD`,
    /// `ARMJIT_BACKGROUND_REJIT` and `ARMJIT_SYNC_INTERVAL`. Malformed values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(mode) = lookup("ARMJIT_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "a64" | "aarch64" => config.mode = ExecutionMode::Aarch64,
                "a32" | "arm" | "aarch32" => config.mode = ExecutionMode::Aarch32Arm,
                other => log::warn!("ignoring ARMJIT_MODE={other}"),
            }
        }
        if let Some(v) = parse_var(&lookup, "ARMJIT_ARENA_SIZE") {
            config = config.with_arena_size(v);
        }
        if let Some(v) = parse_var(&lookup, "ARMJIT_MAX_BLOCK") {
            config = config.with_max_block_instructions(v);
        }
        if let Some(v) = parse_var(&lookup, "ARMJIT_TIERED") {
            config = config.with_tiered(v);
        }
        if let Some(v) = parse_var(&lookup, "ARMJIT_REJIT_THRESHOLD") {
            config = config.with_rejit_threshold(v);
        }
        if let Some(v) = parse_var(&lookup, "ARMJIT_BACKGROUND_REJIT") {
            config = config.with_background_rejit(v);
        }
        if let Some(v) = parse_var(&lookup, "ARMJIT_SYNC_INTERVAL") {
            config = config.with_sync_interval(v);
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {key}={raw}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert_eq!(config.mode, ExecutionMode::Aarch64);
        assert_eq!(config.arena_size, DEFAULT_ARENA_SIZE);
        assert!(config.tiered);
    }

    #[test]
    fn test_builder_clamps() {
        let config = JitConfig::new(ExecutionMode::Aarch32Arm)
            .with_max_block_instructions(0)
            .with_sync_interval(-5)
            .with_rejit_threshold(0);
        assert_eq!(config.mode, ExecutionMode::Aarch32Arm);
        assert_eq!(config.max_block_instructions, 1);
        assert_eq!(config.sync_interval, 1);
        assert_eq!(config.rejit_threshold, 1);
    }

    #[test]
    fn test_lookup_overrides_and_ignores_garbage() {
        let _ = env_logger::builder().is_test(true).try_init();
        let vars: HashMap<&str, &str> = [
            ("ARMJIT_MODE", "a32"),
            ("ARMJIT_ARENA_SIZE", "1048576"),
            ("ARMJIT_TIERED", "false"),
            ("ARMJIT_SYNC_INTERVAL", "lots"),
        ]
        .into_iter()
        .collect();

        let config = JitConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.mode, ExecutionMode::Aarch32Arm);
        assert_eq!(config.arena_size, 1 << 20);
        assert!(!config.tiered);
        assert_eq!(config.sync_interval, JitConfig::default().sync_interval);
    }
}
