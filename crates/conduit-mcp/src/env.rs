//! `${VAR}` / `${VAR:-default}` substitution for server configuration.
//!
//! Expansion runs when a client connects, not when configuration is loaded,
//! so environment changes made in between are picked up.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static DEFAULTED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*):-([^}]*)\}").expect("valid regex")
});

static PLAIN_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Expand environment references in `input`. Never fails.
///
/// `${VAR:-default}` is resolved first and falls back to `default` when
/// `VAR` is unset or empty. Remaining `${VAR}` references resolve to the
/// variable's value, or the empty string when it is unset.
pub fn expand_env(input: &str) -> String {
    if !input.contains("${") {
        return input.to_string();
    }

    let with_defaults = DEFAULTED_VAR.replace_all(input, |caps: &Captures<'_>| {
        match std::env::var(&caps[1]) {
            Ok(value) if !value.is_empty() => value,
            _ => caps[2].to_string(),
        }
    });

    PLAIN_VAR
        .replace_all(&with_defaults, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Expand every element of a slice.
pub fn expand_env_slice(values: &[String]) -> Vec<String> {
    values.iter().map(|v| expand_env(v)).collect()
}

/// Expand every value of a map. Keys are left untouched.
pub fn expand_env_map(values: &HashMap<String, String>) -> HashMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), expand_env(v)))
        .collect()
}

/// Parent environment with `overrides` applied on top, one entry per key.
pub fn merged_env(overrides: &HashMap<String, String>) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();
    for (k, v) in overrides {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Build a deduplicated `KEY=VALUE` list for a subprocess: the parent
/// environment with `overrides` winning on conflict.
pub fn build_env(overrides: &HashMap<String, String>) -> Vec<String> {
    merged_env(overrides)
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names; tests run in parallel and share
    // the process environment.

    fn set(key: &str, value: &str) {
        // SAFETY: every test touches a distinct variable name.
        unsafe { std::env::set_var(key, value) };
    }

    fn unset(key: &str) {
        // SAFETY: every test touches a distinct variable name.
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn default_used_when_unset() {
        unset("CONDUIT_TEST_UNSET_A");
        assert_eq!(expand_env("${CONDUIT_TEST_UNSET_A:-d}"), "d");
    }

    #[test]
    fn value_wins_over_default() {
        set("CONDUIT_TEST_SET_B", "real");
        assert_eq!(expand_env("${CONDUIT_TEST_SET_B:-d}"), "real");
    }

    #[test]
    fn empty_value_takes_default() {
        set("CONDUIT_TEST_EMPTY_C", "");
        assert_eq!(expand_env("${CONDUIT_TEST_EMPTY_C:-fallback}"), "fallback");
    }

    #[test]
    fn unset_plain_var_is_empty() {
        unset("CONDUIT_TEST_UNSET_D");
        assert_eq!(expand_env("${CONDUIT_TEST_UNSET_D}"), "");
        assert_eq!(expand_env("a-${CONDUIT_TEST_UNSET_D}-b"), "a--b");
    }

    #[test]
    fn default_may_be_empty_or_contain_symbols() {
        unset("CONDUIT_TEST_UNSET_E");
        assert_eq!(expand_env("${CONDUIT_TEST_UNSET_E:-}"), "");
        assert_eq!(
            expand_env("${CONDUIT_TEST_UNSET_E:-http://localhost:8080/mcp}"),
            "http://localhost:8080/mcp"
        );
    }

    #[test]
    fn mixed_references() {
        set("CONDUIT_TEST_HOST_F", "example.com");
        unset("CONDUIT_TEST_PORT_F");
        assert_eq!(
            expand_env("https://${CONDUIT_TEST_HOST_F}:${CONDUIT_TEST_PORT_F:-443}/sse"),
            "https://example.com:443/sse"
        );
    }

    #[test]
    fn text_without_references_is_unchanged() {
        assert_eq!(expand_env("plain $HOME text"), "plain $HOME text");
        assert_eq!(expand_env("${not valid}"), "${not valid}");
    }

    #[test]
    fn slice_and_map_expand_elementwise() {
        set("CONDUIT_TEST_TOKEN_G", "secret");
        let args = vec!["--token".to_string(), "${CONDUIT_TEST_TOKEN_G}".to_string()];
        assert_eq!(expand_env_slice(&args), vec!["--token", "secret"]);

        let mut headers = HashMap::new();
        headers.insert(
            "Authorization".to_string(),
            "Bearer ${CONDUIT_TEST_TOKEN_G}".to_string(),
        );
        let expanded = expand_env_map(&headers);
        assert_eq!(expanded["Authorization"], "Bearer secret");
    }

    #[test]
    fn build_env_overrides_win_and_dedupe() {
        set("CONDUIT_TEST_PARENT_H", "parent");
        let mut overrides = HashMap::new();
        overrides.insert("CONDUIT_TEST_PARENT_H".to_string(), "child".to_string());
        overrides.insert("CONDUIT_TEST_ONLY_H".to_string(), "x".to_string());

        let env = build_env(&overrides);
        let matching: Vec<_> = env
            .iter()
            .filter(|e| e.starts_with("CONDUIT_TEST_PARENT_H="))
            .collect();
        assert_eq!(matching, vec!["CONDUIT_TEST_PARENT_H=child"]);
        assert!(env.contains(&"CONDUIT_TEST_ONLY_H=x".to_string()));
    }

    #[test]
    fn build_env_keeps_parent_environment() {
        set("CONDUIT_TEST_INHERITED_I", "yes");
        let env = build_env(&HashMap::new());
        assert!(env.contains(&"CONDUIT_TEST_INHERITED_I=yes".to_string()));
    }
}
