use std::collections::HashMap;

/// HTTP headers exchanged during the WebSocket handshake
///
/// Lookup is case-insensitive; the spelling of the first insertion is kept
/// for output. Insertion order is not significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: HashMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any existing value under the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(entry) => entry.1 = value,
            None => {
                self.entries.insert(key, (name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Iterate `(name, value)` pairs in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Cookies attached to the client handshake
///
/// Plain, case-sensitive key lookup. Rendered as a single `Cookie` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies {
    entries: HashMap<String, String>,
}

impl Cookies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `Cookie` header value, e.g. `a=1; b=2`, sorted by name
    pub fn header_value(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let mut pairs: Vec<_> = self.entries.iter().collect();
        pairs.sort();
        Some(
            pairs
                .into_iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.insert("X-Api-Key", "abc");
        assert_eq!(headers.get("x-api-key"), Some("abc"));
        assert_eq!(headers.get("X-API-KEY"), Some("abc"));

        headers.insert("x-api-key", "def");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.iter().next(), Some(("X-Api-Key", "def")));
    }

    #[test]
    fn test_cookie_header_value() {
        let mut cookies = Cookies::new();
        assert!(cookies.header_value().is_none());
        cookies.insert("session", "42");
        cookies.insert("lang", "en");
        assert_eq!(cookies.header_value().unwrap(), "lang=en; session=42");
        assert_eq!(cookies.get("Session"), None);
    }
}
