use std::cell::RefCell;
use std::rc::Rc;

use sb_core::{FromValue, ScriptBindError, Value};

use crate::services::{ScriptDataStore, ScriptDataTag};

/// Typed, lazily-fetched, write-through variable scoped to one
/// (script instance, host object, variable name), backed by the engine's
/// per-object script-data store.
pub struct Persistent<T> {
    store: Rc<dyn ScriptDataStore>,
    tag: ScriptDataTag,
    default: Option<T>,
    value: RefCell<Option<T>>,
}

impl<T: FromValue + Into<Value> + Clone> Persistent<T> {
    pub fn new(store: Rc<dyn ScriptDataStore>, tag: ScriptDataTag, default: Option<T>) -> Self {
        Self {
            store,
            tag,
            default,
            value: RefCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.tag.name
    }

    /// Fetch-if-needed read. When a default is configured and the store has
    /// no value, the default is returned without touching the store.
    pub fn get(&self) -> Result<T, ScriptBindError> {
        if let Some(value) = self.value.borrow().clone() {
            return Ok(value);
        }
        let value = match &self.default {
            Some(default) if !self.store.is_set(&self.tag) => default.clone(),
            _ => T::from_value(&self.store.get(&self.tag)?)?,
        };
        *self.value.borrow_mut() = Some(value.clone());
        Ok(value)
    }

    /// Write-through: the store is updated immediately and later reads in
    /// this instance hit the local copy.
    pub fn set(&self, value: T) -> Result<(), ScriptBindError> {
        self.store.set(&self.tag, value.clone().into())?;
        *self.value.borrow_mut() = Some(value);
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.store.is_set(&self.tag)
    }

    pub fn remove(&self) -> Result<(), ScriptBindError> {
        *self.value.borrow_mut() = None;
        if self.store.is_set(&self.tag) {
            self.store.clear(&self.tag)?;
        }
        Ok(())
    }

    /// Drops the local copy so the next read fetches from the store again.
    pub fn invalidate(&self) {
        *self.value.borrow_mut() = None;
    }
}
