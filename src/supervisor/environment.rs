//! Environment handed to the daemon
//!
//! The child inherits the controller's environment; on top of that we inject
//! companion helper paths and a few network defaults. Nothing already set by
//! the caller is overridden.

use super::resolve::Companions;
use std::collections::BTreeMap;
use std::ffi::OsString;

pub const WARPPLUS_BIN: &str = "WARPPLUS_BIN";
pub const SINGBOX_BIN: &str = "SINGBOX_BIN";

/// Defaults: prefer IPv4 endpoints, verbose helper logs, an HTTPS test URL
/// and a direct fallback so the local listener always answers
pub const DEFAULTS: [(&str, &str); 4] = [
    ("WARPPLUS_IPV4", "1"),
    ("WARPPLUS_VERBOSE", "1"),
    ("WARPPLUS_TEST_URL", "https://1.1.1.1/cdn-cgi/trace"),
    ("BP_SOCKS_DIRECT_FALLBACK", "1"),
];

/// Compute the variables to add on top of the inherited environment
///
/// `existing` looks up a variable in the base environment; an empty value
/// counts as unset.
pub fn build_environment<F>(existing: F, companions: &Companions) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<OsString>,
{
    let is_set = |key: &str| existing(key).is_some_and(|v| !v.is_empty());
    let mut env = BTreeMap::new();

    let helpers = [
        (WARPPLUS_BIN, companions.warp_plus.as_ref()),
        (SINGBOX_BIN, companions.sing_box.as_ref()),
    ];
    for (key, path) in helpers {
        if let Some(path) = path
            && !is_set(key)
        {
            env.insert(key.to_string(), path.to_string_lossy().to_string());
        }
    }

    for (key, value) in DEFAULTS {
        if !is_set(key) {
            env.insert(key.to_string(), value.to_string());
        }
    }

    env
}

/// Same as [`build_environment`] against the current process environment
pub fn from_process(companions: &Companions) -> BTreeMap<String, String> {
    build_environment(|key| std::env::var_os(key), companions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn base(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_on_empty_environment() {
        let env = build_environment(base(&[]), &Companions::default());
        assert_eq!(env.len(), DEFAULTS.len());
        assert_eq!(env["WARPPLUS_IPV4"], "1");
        assert_eq!(env["WARPPLUS_TEST_URL"], "https://1.1.1.1/cdn-cgi/trace");
        assert!(!env.contains_key(WARPPLUS_BIN));
        assert!(!env.contains_key(SINGBOX_BIN));
    }

    #[test]
    fn test_caller_values_are_kept() {
        let env = build_environment(
            base(&[("WARPPLUS_IPV4", "0"), (WARPPLUS_BIN, "/usr/local/bin/warp-plus")]),
            &Companions {
                warp_plus: Some(PathBuf::from("/opt/bp/warp-plus")),
                sing_box: Some(PathBuf::from("/opt/bp/sb-helper")),
            },
        );
        assert!(!env.contains_key("WARPPLUS_IPV4"));
        assert!(!env.contains_key(WARPPLUS_BIN));
        assert_eq!(env[SINGBOX_BIN], "/opt/bp/sb-helper");
        assert_eq!(env["WARPPLUS_VERBOSE"], "1");
    }

    #[test]
    fn test_empty_value_counts_as_unset() {
        let env = build_environment(base(&[("WARPPLUS_VERBOSE", "")]), &Companions::default());
        assert_eq!(env["WARPPLUS_VERBOSE"], "1");
    }
}
