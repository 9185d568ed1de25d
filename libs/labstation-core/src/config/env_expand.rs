//! `${VAR}` environment-variable expansion inside raw config text, ahead of
//! YAML parsing. Ambient config plumbing, not a spec feature area: measurement
//! labs routinely inject host/port/credentials this way before the declared
//! schema is ever touched.

use regex::Regex;
use std::sync::LazyLock;

static VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|e| {
        unreachable!("static env-expansion pattern must compile: {e}")
    }));

/// Replaces every `${VAR}` occurrence with the value of the environment
/// variable `VAR`, or leaves the placeholder untouched if it is unset.
pub(super) fn expand(text: &str) -> String {
    VAR_PATTERN
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
