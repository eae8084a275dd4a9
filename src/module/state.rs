//! Per-node module state and the parser for probe output
//!
//! All text scraping of node inspection output lives here. The probe script
//! prints `key=value` lines read from the bundle's sysfs parameters:
//!
//! ```text
//! loaded=1
//! release=4.0.35
//! scm=v4.0.35-7-gdeadbee
//! base=v4.0.35
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Script run on each node to inspect the loaded bundle
pub const PROBE_SCRIPT: &str = r#"P=/sys/module/sunrpc/parameters
r=$(cat "$P/nfs_bundle_version" 2>/dev/null)
s=$(cat "$P/nfs_bundle_git_version" 2>/dev/null)
b=$(cat "$P/nfs_bundle_base_git_version" 2>/dev/null)
if [ -n "$r$s" ]; then echo loaded=1; else echo loaded=0; fi
echo "release=$r"
echo "scm=$s"
echo "base=$b""#;

/// Errors while interpreting probe output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("probe output has no 'loaded' marker")]
    MissingLoadedMarker,

    #[error("invalid 'loaded' marker value: {0}")]
    InvalidLoadedMarker(String),
}

/// Module load state of a single node
///
/// Derived from live inspection on every call, never persisted. When
/// `loaded` is false every version field is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleState {
    pub loaded: bool,

    /// Release version, or the source-control version when no release
    /// marker exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Source-control version of the base the build was made from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_version: Option<String>,

    /// Source-control version, only when it differs from the base
    /// (cherry-picked or local builds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,
}

impl ModuleState {
    pub fn not_loaded() -> Self {
        Self::default()
    }

    /// A loaded module with a plain release version
    pub fn loaded(version: impl Into<String>) -> Self {
        Self {
            loaded: true,
            version: Some(version.into()),
            base_version: None,
            build_version: None,
        }
    }

    /// Exact string match against a target version
    pub fn matches_version(&self, target: &str) -> bool {
        self.loaded && self.version.as_deref() == Some(target)
    }

    /// Version for display, with the build version appended when present
    pub fn display_version(&self) -> String {
        match (&self.version, &self.build_version) {
            (Some(v), Some(b)) if v != b => format!("{} ({})", v, b),
            (Some(v), _) => v.clone(),
            (None, _) if self.loaded => "unknown".to_string(),
            (None, _) => "-".to_string(),
        }
    }
}

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(loaded|release|scm|base)=(.*?)\s*$").expect("static regex is valid")
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

/// Parse probe output into a [`ModuleState`]
///
/// Unknown lines (shell noise, warnings) are ignored. The last occurrence of
/// a marker wins.
pub fn parse_probe_output(output: &str) -> Result<ModuleState, ParseError> {
    let mut loaded = None;
    let mut release = None;
    let mut scm = None;
    let mut base = None;

    for line in output.lines() {
        let Some(caps) = marker_pattern().captures(line) else {
            continue;
        };
        let value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        match &caps[1] {
            "loaded" => loaded = Some(value.to_string()),
            "release" => release = Some(value),
            "scm" => scm = Some(value),
            "base" => base = Some(value),
            _ => {}
        }
    }

    let loaded = match loaded.as_deref() {
        Some("1") => true,
        Some("0") => false,
        Some(other) => return Err(ParseError::InvalidLoadedMarker(other.to_string())),
        None => return Err(ParseError::MissingLoadedMarker),
    };

    if !loaded {
        return Ok(ModuleState::not_loaded());
    }

    let release = non_empty(release);
    let scm = non_empty(scm);
    let base = non_empty(base);

    let build_version = match (&scm, &base) {
        (Some(s), Some(b)) if s != b => Some(s.clone()),
        _ => None,
    };

    Ok(ModuleState {
        loaded: true,
        version: release.or_else(|| scm.clone()),
        base_version: base,
        build_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_not_loaded() {
        let out = "loaded=0\nrelease=\nscm=\nbase=\n";
        assert_eq!(parse_probe_output(out).unwrap(), ModuleState::not_loaded());
    }

    #[test]
    fn test_not_loaded_ignores_stale_versions() {
        let out = "loaded=0\nrelease=4.0.35\nscm=v4.0.35\nbase=v4.0.35\n";
        let state = parse_probe_output(out).unwrap();
        assert!(!state.loaded);
        assert!(state.version.is_none());
        assert!(state.base_version.is_none());
        assert!(state.build_version.is_none());
    }

    #[test]
    fn test_parse_plain_release() {
        let out = "loaded=1\nrelease=4.0.35\nscm=v4.0.35\nbase=v4.0.35\n";
        let state = parse_probe_output(out).unwrap();
        assert!(state.loaded);
        assert_eq!(state.version.as_deref(), Some("4.0.35"));
        assert_eq!(state.base_version.as_deref(), Some("v4.0.35"));
        assert!(state.build_version.is_none());
    }

    #[test]
    fn test_parse_cherry_picked_build() {
        let out = "loaded=1\nrelease=4.0.35\nscm=v4.0.35-3-g1a2b3c4\nbase=v4.0.35\n";
        let state = parse_probe_output(out).unwrap();
        assert_eq!(state.version.as_deref(), Some("4.0.35"));
        assert_eq!(state.build_version.as_deref(), Some("v4.0.35-3-g1a2b3c4"));
        // Release version still drives comparisons
        assert!(state.matches_version("4.0.35"));
    }

    #[test]
    fn test_parse_falls_back_to_scm_version() {
        let out = "loaded=1\nrelease=\nscm=v4.1-rc2-11-gfeed\nbase=\n";
        let state = parse_probe_output(out).unwrap();
        assert_eq!(state.version.as_deref(), Some("v4.1-rc2-11-gfeed"));
        assert!(state.build_version.is_none());
    }

    #[test]
    fn test_parse_ignores_noise_and_whitespace() {
        let out = "If you don't see a command prompt, try pressing enter.\n\
                   loaded=1\r\n\
                   release=4.0.36  \n\
                   scm=\n\
                   base=\n";
        let state = parse_probe_output(out).unwrap();
        assert_eq!(state.version.as_deref(), Some("4.0.36"));
    }

    #[test]
    fn test_parse_missing_marker() {
        assert_eq!(
            parse_probe_output("sh: cat: not found\n"),
            Err(ParseError::MissingLoadedMarker)
        );
    }

    #[test]
    fn test_parse_invalid_marker() {
        assert_eq!(
            parse_probe_output("loaded=yes\n"),
            Err(ParseError::InvalidLoadedMarker("yes".to_string()))
        );
    }

    #[test]
    fn test_display_version() {
        assert_eq!(ModuleState::not_loaded().display_version(), "-");
        assert_eq!(ModuleState::loaded("4.0.35").display_version(), "4.0.35");

        let state = parse_probe_output("loaded=1\nrelease=4.0.35\nscm=v4.0.35-3-g1a2b\nbase=v4.0.35\n").unwrap();
        assert_eq!(state.display_version(), "4.0.35 (v4.0.35-3-g1a2b)");
    }

    #[test]
    fn test_matches_version_is_exact() {
        let state = ModuleState::loaded("4.0.35");
        assert!(state.matches_version("4.0.35"));
        assert!(!state.matches_version("4.0.35.0"));
        assert!(!ModuleState::not_loaded().matches_version("4.0.35"));
    }
}
