//! Version information for fedsched.

/// fedsched version from Cargo.toml
pub const FEDSCHED_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub fedsched: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            fedsched: FEDSCHED_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_package() {
        let info = VersionInfo::new();
        assert_eq!(info.fedsched, env!("CARGO_PKG_VERSION"));
        assert!(!info.fedsched.is_empty());
    }
}
