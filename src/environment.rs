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

//! CGI-style environment of a virtual request.

use std::collections::HashMap;

/// Key-value string map handed to backends and scripted handlers.
/// Keys are case-sensitive, as CGI variable names are.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    table: HashMap<String, String>,
}

impl Environment {
    /// Creates an empty environment.
    pub fn new() -> Self {
        Environment::default()
    }

    /// Sets `key`, replacing any existing value.
    pub fn set(&mut self, key: &str, value: &str) {
        self.table.insert(key.to_owned(), value.to_owned());
    }

    /// Sets `key` only if it is not present yet.
    pub fn insert(&mut self, key: &str, value: &str) {
        if !self.table.contains_key(key) {
            self.set(key, value);
        }
    }

    /// Looks up `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.table.get(key).map(String::as_str)
    }

    /// Removes `key`; returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.table.remove(key).is_some()
    }

    /// Number of variables set.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no variables are set.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Removes all variables.
    pub fn reset(&mut self) {
        self.table.clear();
    }

    /// Iterates all variables in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.table.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn environment_set_replaces_insert_keeps() {
        let mut env = Environment::new();
        env.set("PATH_INFO", "/a");
        env.insert("PATH_INFO", "/b");
        assert_eq!(Some("/a"), env.get("PATH_INFO"));
        env.set("PATH_INFO", "/c");
        assert_eq!(Some("/c"), env.get("PATH_INFO"));
    }

    #[test]
    fn environment_keys_are_case_sensitive() {
        let mut env = Environment::new();
        env.set("Path", "x");
        assert_eq!(None, env.get("PATH"));
    }
}
