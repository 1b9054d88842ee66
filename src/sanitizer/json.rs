//! Tool-result scrubbing
//!
//! Function registry results are opaque JSON produced by the host
//! application. Before a result reaches the LLM or a stored trace, object keys
//! that look like credentials or internal fields are removed by walking the
//! value tree.

use serde_json::Value;

const DEFAULT_PREFIXES: &[&str] = &[
    "_",
    "password",
    "secret",
    "api_key",
    "apikey",
    "access_token",
    "refresh_token",
    "private_key",
];

const DEFAULT_EXACT: &[&str] = &["token", "hash", "salt"];

/// Case-insensitive key deny-list
#[derive(Debug, Clone)]
pub struct KeyDenyList {
    prefixes: Vec<String>,
    exact: Vec<String>,
}

impl Default for KeyDenyList {
    fn default() -> Self {
        Self::new(
            DEFAULT_PREFIXES.iter().map(|s| s.to_string()),
            DEFAULT_EXACT.iter().map(|s| s.to_string()),
        )
    }
}

impl KeyDenyList {
    pub fn new(
        prefixes: impl IntoIterator<Item = String>,
        exact: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            prefixes: prefixes.into_iter().map(|p| p.to_lowercase()).collect(),
            exact: exact.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn is_denied(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.exact.iter().any(|e| *e == key) || self.prefixes.iter().any(|p| key.starts_with(p))
    }

    /// Remove denied keys at any depth; returns how many were removed
    pub fn scrub(&self, value: &mut Value) -> usize {
        match value {
            Value::Object(map) => {
                let before = map.len();
                map.retain(|key, _| !self.is_denied(key));
                let mut removed = before - map.len();
                for child in map.values_mut() {
                    removed += self.scrub(child);
                }
                removed
            }
            Value::Array(items) => items.iter_mut().map(|item| self.scrub(item)).sum(),
            _ => 0,
        }
    }

    /// Owned variant of [`scrub`](Self::scrub)
    pub fn scrubbed(&self, mut value: Value) -> Value {
        self.scrub(&mut value);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_credentials_are_removed() {
        let list = KeyDenyList::default();
        let mut value = json!({
            "employees": [
                {"name": "Ana", "passwordHash": "x", "_internalId": 7, "department": "Sales"},
                {"name": "Ben", "API_KEY": "k", "profile": {"secretQuestion": "q", "city": "Oslo"}}
            ],
            "count": 2,
            "token": "t"
        });

        let removed = list.scrub(&mut value);
        assert_eq!(removed, 5);
        assert_eq!(
            value,
            json!({
                "employees": [
                    {"name": "Ana", "department": "Sales"},
                    {"name": "Ben", "profile": {"city": "Oslo"}}
                ],
                "count": 2
            })
        );
    }

    #[test]
    fn test_exact_keys_do_not_match_as_prefix() {
        let list = KeyDenyList::default();
        assert!(list.is_denied("token"));
        assert!(list.is_denied("Hash"));
        assert!(!list.is_denied("tokens_used"));
        assert!(!list.is_denied("hashtag"));
        assert!(!list.is_denied("salary"));
    }

    #[test]
    fn test_scalars_are_untouched() {
        let list = KeyDenyList::default();
        assert_eq!(list.scrubbed(json!("password")), json!("password"));
        assert_eq!(list.scrubbed(json!([1, 2, 3])), json!([1, 2, 3]));
    }
}
