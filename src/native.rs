//! Native bridge: host implementations of methods without bytecode.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::object::Value;
use crate::runtime::Runtime;

/// Host callable standing in for a method body. Arguments arrive in
/// declaration order with the receiver first for instance methods, one
/// [`Value`] per parameter. `None` is returned for `void` methods.
pub type NativeMethod = Rc<dyn Fn(&Runtime, Vec<Value>) -> Result<Option<Value>>>;

/// Wraps a closure as a [`NativeMethod`].
pub fn native<F>(f: F) -> NativeMethod
where
    F: Fn(&Runtime, Vec<Value>) -> Result<Option<Value>> + 'static,
{
    Rc::new(f)
}

/// Per-loader table of native methods keyed `class#name descriptor`.
#[derive(Default)]
pub struct NativeRegistry {
    methods: RefCell<HashMap<String, NativeMethod>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(class: &str, name: &str, descriptor: &str) -> String {
        format!("{class}#{name}{descriptor}")
    }

    /// Registers `method` under `key`. An existing registration is kept and
    /// `false` is returned.
    pub fn register(&self, key: impl Into<String>, method: NativeMethod) -> bool {
        let key = key.into();
        let mut methods = self.methods.borrow_mut();
        if methods.contains_key(&key) {
            warn!(key = %key, "native method already registered, keeping the first");
            return false;
        }
        debug!(key = %key, "registered native method");
        methods.insert(key, method);
        true
    }

    /// Looks up a registration. The returned handle is independent of the
    /// table, so a native may register further methods while it runs.
    pub fn lookup(&self, key: &str) -> Option<NativeMethod> {
        self.methods.borrow().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.methods.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.methods.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
