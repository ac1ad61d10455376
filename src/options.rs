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

//! Per-request option storage.
//!
//! Options are registered once at configuration time; every plugin's options
//! are laid out contiguously in one flat slot vector. A virtual request
//! starts from the registry defaults and `Setting` actions overwrite single
//! slots as the action program runs, so a request never observes an option
//! value changing behind its back.

use std::sync::Arc;

/// One option value. Pointer-shaped values are shared immutable data.
#[derive(Debug, Clone)]
pub enum OptionValue {
    /// Unset/none.
    None,
    /// Boolean flag.
    Bool(bool),
    /// Integer option.
    Number(i64),
    /// Shared string option.
    String(Arc<str>),
}

impl OptionValue {
    /// The boolean value; `false` for non-boolean slots.
    pub fn as_bool(&self) -> bool {
        matches!(*self, OptionValue::Bool(true))
    }

    /// The numeric value; `0` for non-numeric slots.
    pub fn as_number(&self) -> i64 {
        match *self {
            OptionValue::Number(n) => n,
            _ => 0,
        }
    }

    /// The string value; empty for non-string slots.
    pub fn as_str(&self) -> &str {
        match *self {
            OptionValue::String(ref s) => s,
            _ => "",
        }
    }
}

/// Core option slots. Plugins register further slots after these.
pub mod core_options {
    /// `Server` header value; not emitted when empty.
    pub const SERVER_TAG: usize = 0;
    /// Document root used by the docroot action.
    pub const DOC_ROOT: usize = 1;
    /// Bitwise or of the `ETAG_USE_*` flags.
    pub const ETAG_FLAGS: usize = 2;
    /// Emit debug logs for request handling.
    pub const DEBUG_REQUEST_HANDLING: usize = 3;
    /// Number of core slots.
    pub(crate) const COUNT: usize = 4;
}

/// Registry mapping option names to slots and keeping the default values.
#[derive(Debug)]
pub struct OptionRegistry {
    names: Vec<String>,
    defaults: Vec<OptionValue>,
}

impl OptionRegistry {
    /// Creates a registry with the core options pre-registered.
    pub fn new() -> Self {
        let mut reg = OptionRegistry {
            names: Vec::new(),
            defaults: Vec::new(),
        };
        reg.register("server.tag", OptionValue::String(Arc::from("kvik")));
        reg.register("docroot", OptionValue::String(Arc::from("")));
        reg.register(
            "etag.use",
            OptionValue::Number(
                (crate::etag::ETAG_USE_INODE | crate::etag::ETAG_USE_SIZE
                    | crate::etag::ETAG_USE_MTIME) as i64,
            ),
        );
        reg.register("debug.request-handling", OptionValue::Bool(false));
        debug_assert_eq!(core_options::COUNT, reg.len());
        reg
    }

    /// Registers an option; returns its slot index.
    pub fn register(&mut self, name: &str, default: OptionValue) -> usize {
        self.names.push(name.to_owned());
        self.defaults.push(default);
        self.names.len() - 1
    }

    /// Finds the slot index for `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no options are registered.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// A fresh per-request option vector holding the defaults.
    pub fn instantiate(&self) -> Vec<OptionValue> {
        self.defaults.clone()
    }
}

impl Default for OptionRegistry {
    fn default() -> Self {
        OptionRegistry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_registry_assigns_contiguous_slots() {
        let mut reg = OptionRegistry::new();
        let a = reg.register("mod_a.x", OptionValue::Bool(false));
        let b = reg.register("mod_a.y", OptionValue::Number(7));
        assert_eq!(a + 1, b);
        assert_eq!(Some(a), reg.index_of("mod_a.x"));
    }

    #[test]
    fn options_instantiate_copies_defaults() {
        let mut reg = OptionRegistry::new();
        let slot = reg.register("mod_a.x", OptionValue::Number(42));
        let mut opts = reg.instantiate();
        assert_eq!(42, opts[slot].as_number());
        opts[slot] = OptionValue::Number(1);
        // registry defaults are unaffected
        assert_eq!(42, reg.instantiate()[slot].as_number());
    }

    #[test]
    fn options_value_accessors_are_total() {
        assert!(!OptionValue::None.as_bool());
        assert_eq!(0, OptionValue::String(Arc::from("x")).as_number());
        assert_eq!("", OptionValue::Number(3).as_str());
    }
}
