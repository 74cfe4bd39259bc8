//! Environment allow-list expansion
//!
//! Packs never see the process environment directly. Each manifest lists
//! the keys it may read, either exactly (`HOME`) or as a prefix wildcard
//! (`MYAPP_*`), and only those values are copied into the sandbox payload.

use std::collections::BTreeMap;
use thiserror::Error;

/// A rejected environment pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid environment pattern '{pattern}': {reason}")]
pub struct EnvPatternError {
    pub pattern: String,
    pub reason: &'static str,
}

impl EnvPatternError {
    fn new(pattern: &str, reason: &'static str) -> Self {
        Self {
            pattern: pattern.to_string(),
            reason,
        }
    }
}

/// Validate an environment pattern
///
/// Rules:
/// - non-empty, characters limited to `[A-Za-z0-9_*]`
/// - at most one `*`, and only as the last character
/// - a bare `*` is rejected
pub fn validate_env_pattern(pattern: &str) -> Result<(), EnvPatternError> {
    if pattern.is_empty() {
        return Err(EnvPatternError::new(pattern, "empty pattern"));
    }

    if pattern == "*" {
        return Err(EnvPatternError::new(
            pattern,
            "bare wildcard exposes the whole environment",
        ));
    }

    match pattern.matches('*').count() {
        0 => {}
        1 if pattern.ends_with('*') => {}
        1 => return Err(EnvPatternError::new(pattern, "wildcard must be at the end")),
        _ => return Err(EnvPatternError::new(pattern, "multiple wildcards")),
    }

    if !pattern
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '*')
    {
        return Err(EnvPatternError::new(pattern, "invalid characters"));
    }

    Ok(())
}

/// Allow-list of environment keys for one pack
///
/// Patterns are validated once at construction; [`EnvAllowList::collect`]
/// reads the live environment on every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvAllowList {
    exact: Vec<String>,
    prefixes: Vec<String>,
}

impl EnvAllowList {
    /// Build an allow-list from manifest patterns
    pub fn new<I, S>(patterns: I) -> Result<Self, EnvPatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            validate_env_pattern(pattern)?;
            match pattern.strip_suffix('*') {
                Some(prefix) => list.prefixes.push(prefix.to_string()),
                None => list.exact.push(pattern.to_string()),
            }
        }
        Ok(list)
    }

    /// Whether nothing is allowed
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    /// Whether `key` is allowed
    pub fn allows(&self, key: &str) -> bool {
        self.exact.iter().any(|k| k == key) || self.prefixes.iter().any(|p| key.starts_with(p))
    }

    /// Copy the allowed variables present in the process environment
    ///
    /// Missing keys and non-unicode values are omitted.
    pub fn collect(&self) -> BTreeMap<String, String> {
        self.collect_from(std::env::vars_os().filter_map(|(k, v)| {
            Some((k.into_string().ok()?, v.into_string().ok()?))
        }))
    }

    /// Copy the allowed variables from an explicit source
    pub fn collect_from<I>(&self, vars: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if self.is_empty() {
            return BTreeMap::new();
        }
        vars.into_iter().filter(|(k, _)| self.allows(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_env_pattern_valid() {
        assert!(validate_env_pattern("HOME").is_ok());
        assert!(validate_env_pattern("MY_VAR").is_ok());
        assert!(validate_env_pattern("MYAPP_*").is_ok());
    }

    #[test]
    fn test_validate_env_pattern_invalid() {
        assert!(validate_env_pattern("").is_err());
        assert!(validate_env_pattern("*").is_err());
        assert!(validate_env_pattern("*_SECRET").is_err());
        assert!(validate_env_pattern("MY_*_*").is_err());
        assert!(validate_env_pattern("MY-VAR").is_err());
        assert!(validate_env_pattern("MY.VAR").is_err());
    }

    #[test]
    fn test_collect_filters_to_allowed_keys() {
        let list = EnvAllowList::new(["HOME", "MYAPP_*"]).unwrap();
        let vars = vec![
            ("HOME".to_string(), "/home/me".to_string()),
            ("MYAPP_REGION".to_string(), "eu".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "nope".to_string()),
            ("MYAPP".to_string(), "no-underscore".to_string()),
        ];

        let env = list.collect_from(vars);
        assert_eq!(env.len(), 2);
        assert_eq!(env["HOME"], "/home/me");
        assert_eq!(env["MYAPP_REGION"], "eu");
    }

    #[test]
    fn test_empty_list_sees_nothing() {
        let list = EnvAllowList::new(Vec::<String>::new()).unwrap();
        assert!(list.is_empty());
        assert!(list.collect().is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejects_list() {
        let err = EnvAllowList::new(["HOME", "*"]).unwrap_err();
        assert_eq!(err.pattern, "*");
    }
}
