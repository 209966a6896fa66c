//! User-facing error formatting and startup checks.

pub mod errors;

pub use errors::{format_user_error, log_startup_diagnostics};

/// Build identification baked in by `build.rs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    /// UTC build time, `YYYY-MM-DDTHH:MM:SSZ`
    pub stamp: &'static str,
    /// `git describe` output, `-dirty` when built from a modified tree
    pub revision: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            stamp: option_env!("BUILD_STAMP").unwrap_or("unknown"),
            revision: option_env!("GIT_HASH").unwrap_or("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stamp_is_utc_or_unknown() {
        let info = BuildInfo::current();
        if info.stamp != "unknown" {
            assert_eq!(info.stamp.len(), "2026-01-01T00:00:00Z".len(), "{}", info.stamp);
            assert!(info.stamp.ends_with('Z'));
            assert_eq!(info.stamp.as_bytes()[10], b'T');
        }
        assert!(!info.revision.is_empty());
    }
}
