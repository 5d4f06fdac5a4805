//! Ordered, case-insensitive header list.
//!
//! Header order is preserved exactly as received so that forwarded messages
//! keep the client's (or origin's) layout. Lookups ignore ASCII case.

/// Headers that describe a single transport hop and must not be forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// An ordered list of `(name, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a header, keeping any existing header of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all headers named `name` with a single value at the position
    /// of the first occurrence (or at the end if absent).
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= pos || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove every header named `name`. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Comma-separated tokens across all `name` headers, trimmed and lowercased.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// True if any `name` header lists `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Strip hop-by-hop headers, including any named by `Connection`.
    pub fn remove_hop_by_hop(&mut self) {
        let listed = self.tokens("connection");
        self.entries.retain(|(n, _)| {
            !HOP_BY_HOP.iter().any(|h| n.eq_ignore_ascii_case(h))
                && !listed.iter().any(|l| n.eq_ignore_ascii_case(l))
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize as `Name: value\r\n` lines (no terminating blank line).
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Headers {
        let mut h = Headers::new();
        h.append("Host", "example.com");
        h.append("Accept", "*/*");
        h.append("X-Trace", "a");
        h.append("x-trace", "b");
        h
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let h = sample();
        assert_eq!(h.get("HOST"), Some("example.com"));
        assert_eq!(h.get_all("X-TRACE").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!h.contains("cookie"));
    }

    #[test]
    fn set_collapses_duplicates_in_place() {
        let mut h = sample();
        h.set("X-Trace", "c");
        let names: Vec<_> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Host", "Accept", "X-Trace"]);
        assert_eq!(h.get("x-trace"), Some("c"));
    }

    #[test]
    fn hop_by_hop_removal_honours_connection_tokens() {
        let mut h = Headers::new();
        h.append("Host", "example.com");
        h.append("Connection", "keep-alive, X-Secret");
        h.append("X-Secret", "1");
        h.append("Proxy-Connection", "keep-alive");
        h.append("Keep-Alive", "timeout=5");
        h.append("Accept", "text/html");
        h.remove_hop_by_hop();
        let names: Vec<_> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Host", "Accept"]);
    }

    #[test]
    fn tokens_split_across_headers() {
        let mut h = Headers::new();
        h.append("Cache-Control", "no-cache, Max-Age=0");
        h.append("cache-control", "private");
        assert_eq!(h.tokens("cache-control"), vec!["no-cache", "max-age=0", "private"]);
        assert!(h.has_token("Cache-Control", "PRIVATE"));
    }
}
