//! Sandbox profiles
//!
//! A TOML file carrying the resource bounds a host wants to run scripts
//! under. Command-line flags override file values; everything has a
//! conservative default so `moat run script.lua` works out of the box.

use std::path::Path;

use serde::Deserialize;

/// Resource bounds for one script invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxProfile {
    /// Instruction budget per invocation (0 = unlimited).
    pub max_instructions: u64,
    /// Intermediate string size cap, in bytes.
    pub max_string_size: usize,
    /// Source text length cap, in bytes.
    pub max_source_len: usize,
    /// Console queue capacity.
    pub console_capacity: usize,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        SandboxProfile {
            max_instructions: 10_000_000,
            max_string_size: 1 << 20,
            max_source_len: 256 * 1024,
            console_capacity: 32,
        }
    }
}

impl SandboxProfile {
    pub fn load(path: &Path) -> Result<SandboxProfile, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read profile {}: {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("invalid profile {}: {e}", path.display()))
    }

    /// Flag overrides win over file values.
    pub fn with_overrides(
        mut self,
        max_instructions: Option<u64>,
        max_string_size: Option<usize>,
        max_source_len: Option<usize>,
    ) -> SandboxProfile {
        if let Some(v) = max_instructions {
            self.max_instructions = v;
        }
        if let Some(v) = max_string_size {
            self.max_string_size = v;
        }
        if let Some(v) = max_source_len {
            self.max_source_len = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_bounded() {
        let p = SandboxProfile::default();
        assert!(p.max_instructions > 0);
        assert!(p.max_string_size > 0);
        assert_eq!(p.console_capacity, 32);
    }

    #[test]
    fn loads_partial_profiles() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "max_instructions = 500").unwrap();
        let p = SandboxProfile::load(f.path()).unwrap();
        assert_eq!(p.max_instructions, 500);
        assert_eq!(p.console_capacity, SandboxProfile::default().console_capacity);
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "max_instrs = 500").unwrap();
        assert!(SandboxProfile::load(f.path()).is_err());
    }

    #[test]
    fn overrides_win() {
        let p = SandboxProfile::default().with_overrides(Some(1), None, Some(2));
        assert_eq!(p.max_instructions, 1);
        assert_eq!(p.max_source_len, 2);
        assert_eq!(
            p.max_string_size,
            SandboxProfile::default().max_string_size
        );
    }
}
