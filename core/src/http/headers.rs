/*
 * headers.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Smistatore, an HTTP connection manager.
 *
 * Smistatore is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Smistatore is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Smistatore.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Ordered header list with case-insensitive names.

/// Headers that may appear at most once; appending replaces the existing value.
const SINGLETON_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "content-type",
    "user-agent",
    "authorization",
    "proxy-authorization",
    "connection",
    "accept-encoding",
    "accept-language",
    "location",
];

fn is_singleton(name: &str) -> bool {
    SINGLETON_HEADERS.iter().any(|s| s.eq_ignore_ascii_case(name))
}

/// Header fields in wire order. Names keep the case they were given; lookup ignores case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. Well-known singleton headers replace any existing value instead.
    pub fn append(&mut self, name: &str, value: &str) {
        if is_singleton(name) {
            self.set(name, value);
        } else {
            self.fields.push((name.to_string(), value.to_string()));
        }
    }

    /// Append without singleton handling, as received on the wire.
    pub fn push(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Replace all fields named `name` with one field, kept at the position of the first.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.fields.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.fields[pos] = (name.to_string(), value.to_string());
                let mut i = pos + 1;
                while i < self.fields.len() {
                    if self.fields[i].0.eq_ignore_ascii_case(name) {
                        self.fields.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }

    /// Insert at the front, replacing any existing field of the same name.
    pub fn prepend(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.fields.insert(0, (name.to_string(), value.to_string()));
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Whether a comma-separated header contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup() {
        let mut h = HeaderList::new();
        h.append("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert!(h.contains("CONTENT-TYPE"));
    }

    #[test]
    fn duplicates_appended() {
        let mut h = HeaderList::new();
        h.append("Accept", "text/html");
        h.append("accept", "image/png");
        let all: Vec<&str> = h.get_all("Accept").collect();
        assert_eq!(all, vec!["text/html", "image/png"]);
    }

    #[test]
    fn singleton_replaced() {
        let mut h = HeaderList::new();
        h.append("X-A", "1");
        h.append("User-Agent", "a");
        h.append("user-agent", "b");
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("User-Agent"), Some("b"));
    }

    #[test]
    fn prepend_goes_first() {
        let mut h = HeaderList::new();
        h.append("Accept", "*/*");
        h.prepend("Host", "example.com");
        assert_eq!(h.iter().next(), Some(("Host", "example.com")));
    }

    #[test]
    fn token_match() {
        let mut h = HeaderList::new();
        h.append("Connection", "Keep-Alive, Upgrade");
        assert!(h.has_token("connection", "upgrade"));
        assert!(!h.has_token("connection", "close"));
    }
}
