//! Runtime configuration types.

use serde::Deserialize;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile hot functions)
    On,
    /// Automatic: JIT enabled if supported on this platform
    #[default]
    Auto,
}

/// Runtime configuration for the engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Call count after which a function is JIT compiled
    pub jit_threshold: u32,
    /// Whether to trace JIT events to stderr
    pub trace_jit: bool,
    /// Whether to dump emitted JIT code and RO data descriptors
    pub dump_jit_code: bool,
    /// Whether to trace function entry/exit
    pub trace_calls: bool,
    /// Whether the embedder's front end defers function bodies (ignored
    /// in lean builds)
    pub lazy_compilation: bool,
    /// Hard limit on heap size in bytes, enforced by the GC (None =
    /// unlimited)
    pub heap_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 100,
            trace_jit: false,
            dump_jit_code: false,
            trace_calls: false,
            lazy_compilation: true,
            heap_limit: None,
        }
    }
}

impl RuntimeConfig {
    /// Whether the JIT should be used on this platform.
    pub fn jit_enabled(&self) -> bool {
        match self.jit_mode {
            JitMode::Off => false,
            JitMode::On => cfg!(feature = "jit"),
            JitMode::Auto => cfg!(all(feature = "jit", target_arch = "aarch64")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"jit_mode": "off", "jit_threshold": 7}"#).unwrap();
        assert_eq!(config.jit_mode, JitMode::Off);
        assert_eq!(config.jit_threshold, 7);
        assert!(config.lazy_compilation);
        assert!(!config.jit_enabled());
    }
}
