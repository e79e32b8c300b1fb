//! Code generation knobs.
//!
//! Defaults are safe for both backends; `from_env` layers environment
//! overrides on top (unparsable values are ignored):
//!
//! | variable               | field             |
//! |------------------------|-------------------|
//! | `TANDEM_TEAL_VERSION`  | `pragma_version`  |
//! | `TANDEM_EMIT_COMMENTS` | `emit_comments`   |
//! | `TANDEM_MAX_GROUP`     | `max_group_size`  |

use serde::{Deserialize, Serialize};

/// Options shared by every lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileConfig {
    /// `#pragma version` emitted in stack-machine programs.
    pub pragma_version: u8,
    /// Emit line comments (including per-check rejection notes).
    pub emit_comments: bool,
    /// Largest transaction group the stack-machine ledger accepts.
    pub max_group_size: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            pragma_version: 2,
            emit_comments: true,
            max_group_size: 16,
        }
    }
}

impl CompileConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Apply environment overrides to `self`.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("TANDEM_TEAL_VERSION") {
            if let Ok(v) = v.parse::<u8>() {
                self.pragma_version = v;
            }
        }
        if let Ok(v) = std::env::var("TANDEM_EMIT_COMMENTS") {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.emit_comments = true,
                "0" | "false" | "no" => self.emit_comments = false,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("TANDEM_MAX_GROUP") {
            if let Ok(v) = v.parse::<usize>() {
                self.max_group_size = v;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = CompileConfig::default();
        assert_eq!(c.pragma_version, 2);
        assert!(c.emit_comments);
        assert_eq!(c.max_group_size, 16);
    }
}
