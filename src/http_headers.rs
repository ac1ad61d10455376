// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Insertion-ordered HTTP header storage with case-insensitive name
//! matching. Each entry keeps its full `Name: value` line so response
//! serialization is a plain copy.

/// A single header entry.
#[derive(Debug, Clone)]
pub struct HttpHeader {
    keylen: usize,
    data: String,
}

impl HttpHeader {
    fn new(key: &str, value: &str) -> Self {
        let mut data = String::with_capacity(key.len() + 2 + value.len());
        data.push_str(key);
        data.push_str(": ");
        data.push_str(value);
        HttpHeader {
            keylen: key.len(),
            data,
        }
    }

    /// Header name as received.
    pub fn key(&self) -> &str {
        &self.data[..self.keylen]
    }

    /// Header value (everything after `": "`).
    pub fn value(&self) -> &str {
        &self.data[self.keylen + 2..]
    }

    /// The full `Name: value` line.
    pub fn line(&self) -> &str {
        &self.data
    }

    /// Case-insensitive name comparison.
    pub fn key_is(&self, key: &str) -> bool {
        self.key().eq_ignore_ascii_case(key)
    }
}

/// Ordered header list.
#[derive(Debug, Clone, Default)]
pub struct HttpHeaders {
    entries: Vec<HttpHeader>,
}

impl HttpHeaders {
    /// Creates an empty list.
    pub fn new() -> Self {
        HttpHeaders::default()
    }

    /// Removes all entries, keeping the allocation.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends `", value"` to an existing header, or inserts a new entry.
    pub fn append(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|h| h.key_is(key)) {
            Some(h) => {
                h.data.push_str(", ");
                h.data.push_str(value);
            }
            None => self.entries.push(HttpHeader::new(key, value)),
        }
    }

    /// Inserts a new entry, keeping any existing entries with the same name.
    pub fn insert(&mut self, key: &str, value: &str) {
        self.entries.push(HttpHeader::new(key, value));
    }

    /// Replaces the value of the first matching entry, or inserts one.
    pub fn overwrite(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|h| h.key_is(key)) {
            Some(h) => {
                let key = h.key().to_owned();
                *h = HttpHeader::new(&key, value);
            }
            None => self.entries.push(HttpHeader::new(key, value)),
        }
    }

    /// Removes all entries with this name; returns whether any existed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|h| !h.key_is(key));
        before != self.entries.len()
    }

    /// The first entry with this name.
    pub fn lookup(&self, key: &str) -> Option<&HttpHeader> {
        self.entries.iter().find(|h| h.key_is(key))
    }

    /// The value of the first entry with this name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lookup(key).map(|h| h.value())
    }

    /// Iterates the values of all entries with this name.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |h| h.key_is(key))
            .map(|h| h.value())
    }

    /// Number of entries with this name.
    pub fn count(&self, key: &str) -> usize {
        self.entries.iter().filter(|h| h.key_is(key)).count()
    }

    /// Case-insensitive value test against the first matching entry.
    pub fn header_is(&self, key: &str, value: &str) -> bool {
        self.get(key)
            .map(|v| v.trim().eq_ignore_ascii_case(value))
            .unwrap_or(false)
    }

    /// All values with this name joined with `", "`; empty when absent.
    pub fn get_joined(&self, key: &str) -> String {
        let mut out = String::new();
        for v in self.values(key) {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(v);
        }
        out
    }

    /// Iterates all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &HttpHeader> {
        self.entries.iter()
    }

    /// Appends folded continuation text to the most recent entry. Returns
    /// `false` if there is no entry to continue.
    pub(crate) fn append_to_last(&mut self, more: &str) -> bool {
        match self.entries.last_mut() {
            Some(h) => {
                h.data.push(' ');
                h.data.push_str(more);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let mut h = HttpHeaders::new();
        h.insert("Content-Length", "13");
        assert_eq!(Some("13"), h.get("content-length"));
        assert_eq!(Some("13"), h.get("CONTENT-LENGTH"));
        assert_eq!("Content-Length", h.lookup("content-length").unwrap().key());
    }

    #[test]
    fn headers_append_joins_with_comma() {
        let mut h = HttpHeaders::new();
        h.append("Vary", "Accept");
        h.append("vary", "Accept-Encoding");
        assert_eq!(Some("Accept, Accept-Encoding"), h.get("Vary"));
        assert_eq!(1, h.len());
    }

    #[test]
    fn headers_insert_keeps_duplicates() {
        let mut h = HttpHeaders::new();
        h.insert("Host", "a");
        h.insert("host", "b");
        assert_eq!(2, h.count("HOST"));
        let values: Vec<&str> = h.values("host").collect();
        assert_eq!(vec!["a", "b"], values);
    }

    #[test]
    fn headers_overwrite_replaces_value() {
        let mut h = HttpHeaders::new();
        h.insert("Connection", "keep-alive");
        h.overwrite("connection", "close");
        assert_eq!(Some("close"), h.get("Connection"));
        assert_eq!(1, h.len());
    }

    #[test]
    fn headers_header_is_trims_and_ignores_case() {
        let mut h = HttpHeaders::new();
        h.insert("Connection", " Keep-Alive ");
        assert!(h.header_is("connection", "keep-alive"));
        assert!(!h.header_is("connection", "close"));
    }

    #[test]
    fn headers_remove_drops_all_duplicates() {
        let mut h = HttpHeaders::new();
        h.insert("X-A", "1");
        h.insert("x-a", "2");
        assert!(h.remove("X-A"));
        assert!(h.is_empty());
        assert!(!h.remove("X-A"));
    }
}
