//! Semicolon-delimited `key=value` connection strings.
//!
//! Profiles can be described by a connection string (`AuthType=ClientSecret;
//! Url=...;ClientId=...`). Keys are case-insensitive and insertion order is
//! preserved so exported strings are stable.

use crate::error::ConnectionError;

/// Replacement for password values on export
pub const MASKED_PASSWORD: &str = "********";

/// Replacement for client-secret values on export
pub const MASKED_CLIENT_SECRET: &str = "*************";

/// Ordered, case-insensitive `key=value` map behind a connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStringMap {
    entries: Vec<(String, String)>,
}

impl ConnectionStringMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a semicolon-delimited string. Empty segments are skipped; a
    /// segment without `=` is a configuration error.
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let mut map = Self::new();
        for segment in raw.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                ConnectionError::configuration(format!(
                    "malformed connection string segment: {segment:?}"
                ))
            })?;
            map.set(key.trim(), trim_quotes(value.trim()));
        }
        Ok(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// First value present among `keys`, in the order given.
    pub fn get_first(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets `key`, replacing an existing entry regardless of casing.
    pub fn set(&mut self, key: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    /// Removes `key` and returns its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.entries.remove(index).1)
    }

    /// Sets `key` only when absent.
    pub fn ensure(&mut self, key: &str, value: &str) {
        if !self.contains(key) {
            self.set(key, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for ConnectionStringMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

fn trim_quotes(value: &str) -> &str {
    let trimmed = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
    trimmed.unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segments_in_order() {
        let map =
            ConnectionStringMap::parse("AuthType=ClientSecret;Url=https://org.crm.dynamics.com;ClientId=abc")
                .unwrap();
        assert_eq!(map.get("AuthType"), Some("ClientSecret"));
        assert_eq!(map.get("Url"), Some("https://org.crm.dynamics.com"));
        assert_eq!(
            map.to_string(),
            "AuthType=ClientSecret;Url=https://org.crm.dynamics.com;ClientId=abc"
        );
    }

    #[test]
    fn keys_are_case_insensitive() {
        let map = ConnectionStringMap::parse("URL=https://example.org").unwrap();
        assert_eq!(map.get("url"), Some("https://example.org"));
        assert_eq!(map.get("Url"), Some("https://example.org"));
    }

    #[test]
    fn values_may_contain_equals() {
        let map = ConnectionStringMap::parse("Password=a=b=c;Url=x").unwrap();
        assert_eq!(map.get("Password"), Some("a=b=c"));
    }

    #[test]
    fn quoted_values_are_unwrapped() {
        let map = ConnectionStringMap::parse("Username='jane doe'").unwrap();
        assert_eq!(map.get("Username"), Some("jane doe"));

        // A quoted semicolon still splits; this surface does not support
        // embedded separators.
        let error = ConnectionStringMap::parse("Password=\"semi;free\"").unwrap_err();
        assert!(matches!(error, ConnectionError::Configuration(_)));
    }

    #[test]
    fn empty_segments_are_skipped() {
        let map = ConnectionStringMap::parse("Url=x;;AuthType=AD;").unwrap();
        assert_eq!(map.get("AuthType"), Some("AD"));
    }

    #[test]
    fn malformed_segment_is_an_error() {
        assert!(matches!(
            ConnectionStringMap::parse("Url=x;garbage"),
            Err(ConnectionError::Configuration(_))
        ));
    }

    #[test]
    fn set_replaces_existing_casing_insensitively() {
        let mut map = ConnectionStringMap::parse("password=old").unwrap();
        map.set("Password", "new");
        assert_eq!(map.to_string(), "password=new");
    }

    #[test]
    fn ensure_does_not_overwrite() {
        let mut map = ConnectionStringMap::parse("RequireNewInstance=False").unwrap();
        map.ensure("RequireNewInstance", "True");
        assert_eq!(map.get("RequireNewInstance"), Some("False"));

        let mut map = ConnectionStringMap::new();
        map.ensure("RequireNewInstance", "True");
        assert_eq!(map.get("RequireNewInstance"), Some("True"));
    }

    #[test]
    fn get_first_respects_priority() {
        let map = ConnectionStringMap::parse("Server=b;ServiceUri=a").unwrap();
        assert_eq!(map.get_first(&["ServiceUri", "Url", "Server"]), Some("a"));
    }
}
