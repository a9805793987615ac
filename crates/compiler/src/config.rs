//! Compiler configuration
//!
//! A small knob set controlling what the backend emits. Loadable from a
//! TOML `[build]` table so projects can pin their settings next to the
//! source.

use serde::Deserialize;

/// Configuration for one compilation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Emit runtime checks for `assert` statements. When false, asserts
    /// are discarded during lowering.
    pub emit_asserts: bool,
    /// Apply the constant subtraction peepholes (`SUB 0` elided,
    /// `SUB 1` as DECQ, `SUB -1` as INCQ). Disable when diffing output
    /// against a reference.
    pub peephole: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            emit_asserts: true,
            peephole: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    build: Option<CompilerConfig>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_asserts(mut self, emit: bool) -> Self {
        self.emit_asserts = emit;
        self
    }

    pub fn with_peephole(mut self, peephole: bool) -> Self {
        self.peephole = peephole;
        self
    }

    /// Parse a configuration from TOML text. Unknown keys are rejected.
    pub fn from_toml(content: &str) -> Result<Self, String> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| format!("Invalid config: {}", e))?;
        Ok(file.build.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert!(config.emit_asserts);
        assert!(config.peephole);
    }

    #[test]
    fn test_builder() {
        let config = CompilerConfig::new().with_asserts(false).with_peephole(false);
        assert!(!config.emit_asserts);
        assert!(!config.peephole);
    }

    #[test]
    fn test_from_toml() {
        let config = CompilerConfig::from_toml(
            r#"
            [build]
            emit_asserts = false
            "#,
        )
        .unwrap();
        assert!(!config.emit_asserts);
        assert!(config.peephole);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = CompilerConfig::from_toml("").unwrap();
        assert!(config.emit_asserts);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = CompilerConfig::from_toml(
            r#"
            [build]
            optimize_hard = true
            "#,
        )
        .unwrap_err();
        assert!(err.contains("Invalid config"));
    }
}
