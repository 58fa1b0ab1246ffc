use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use sb_core::{Curve, ObjectId, ScriptBindError, Time, Value, Vector};

use crate::script::LogLevel;
use crate::services::{InheritanceGraph, PropertyChange, PropertyKey, PropertyStore};

pub const DESIGN_NOTE_MAJOR: &str = "DesignNote";

fn design_note_key() -> PropertyKey {
    PropertyKey::new(DESIGN_NOTE_MAJOR)
}

fn fold(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Parses one encoded parameter string into a name→value table.
///
/// Tokens have the form `name=value` or `name(index)=value`, separated by any
/// mix of whitespace and `;`. Values are unquoted (terminated by a separator)
/// or double-quoted with backslash escapes. Malformed fragments are skipped;
/// the last occurrence of a key wins.
pub fn parse_design_note(text: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let is_sep = |c: char| c.is_whitespace() || c == ';';
    let mut i = 0;

    while i < len {
        while i < len && is_sep(chars[i]) {
            i += 1;
        }
        if i >= len {
            break;
        }

        let name_start = i;
        while i < len && !is_sep(chars[i]) && chars[i] != '(' && chars[i] != '=' {
            i += 1;
        }
        let name: String = chars[name_start..i].iter().collect();
        let mut key = name.clone();
        let mut malformed = name.is_empty();

        if i < len && chars[i] == '(' {
            i += 1;
            let index_start = i;
            while i < len && chars[i] != ')' && !is_sep(chars[i]) {
                i += 1;
            }
            if i < len && chars[i] == ')' {
                let index: String = chars[index_start..i].iter().collect();
                key = format!("{}({})", name, index);
                i += 1;
            } else {
                malformed = true;
            }
        }

        if i < len && chars[i] == '=' {
            i += 1;
        } else {
            malformed = true;
        }
        if malformed {
            while i < len && !is_sep(chars[i]) {
                i += 1;
            }
            continue;
        }

        let value;
        if i < len && chars[i] == '"' {
            i += 1;
            let mut quoted = String::new();
            let mut escaped = false;
            let mut terminated = false;
            while i < len {
                let c = chars[i];
                i += 1;
                if escaped {
                    quoted.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    terminated = true;
                    break;
                } else {
                    quoted.push(c);
                }
            }
            if !terminated {
                continue;
            }
            value = quoted;
        } else {
            let value_start = i;
            while i < len && !is_sep(chars[i]) {
                i += 1;
            }
            value = chars[value_start..i].iter().collect();
        }

        values.insert(fold(&key), value);
    }

    values
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '"' | '(' | ')' | '=' | '\\'))
}

fn encode_design_note(values: &BTreeMap<String, String>) -> String {
    values
        .iter()
        .map(|(key, value)| {
            if needs_quoting(value) {
                format!(
                    "{}=\"{}\"",
                    key,
                    value.replace('\\', "\\\\").replace('"', "\\\"")
                )
            } else {
                format!("{}={}", key, value)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// One object's cached parameter state.
#[derive(Default)]
struct DesignNote {
    direct_watchers: BTreeMap<u64, Weak<Cell<bool>>>,
    indirect_watchers: usize,
    cached: bool,
    existent: bool,
    relevant: bool,
    ancestors: Vec<ObjectId>,
    raw_values: BTreeMap<String, String>,
}

#[derive(Default)]
struct CacheData {
    entries: BTreeMap<ObjectId, DesignNote>,
    /// Object currently being written back, so the change notification for
    /// our own write does not invalidate the entry it came from.
    current: ObjectId,
}

/// Process-wide parameter cache, shared by every script instance bound to one
/// engine. Parses the encoded parameter string attached to each object,
/// resolves values through the inheritance chain, and invalidates lazily on
/// property-change notifications.
pub struct ParameterCache {
    properties: Rc<dyn PropertyStore>,
    traits: Rc<dyn InheritanceGraph>,
    state: RefCell<CacheData>,
    next_watcher: Cell<u64>,
}

impl ParameterCache {
    pub fn new(properties: Rc<dyn PropertyStore>, traits: Rc<dyn InheritanceGraph>) -> Rc<Self> {
        let cache = Rc::new(Self {
            properties,
            traits,
            state: RefCell::new(CacheData::default()),
            next_watcher: Cell::new(1),
        });
        let weak = Rc::downgrade(&cache);
        cache
            .properties
            .subscribe_property(DESIGN_NOTE_MAJOR, Box::new(move |change| {
                if let Some(cache) = weak.upgrade() {
                    cache.on_design_note_change(change);
                }
            }));
        cache
    }

    /// Ensures the object's entry holds a parse of its current encoded string.
    fn update_entry(&self, object: ObjectId) {
        let up_to_date = self
            .state
            .borrow()
            .entries
            .get(&object)
            .map(|entry| entry.cached)
            .unwrap_or(false);
        if up_to_date {
            return;
        }

        // Raw read: the cache performs its own ancestry walk, so an
        // inherited store lookup here would double-resolve.
        let raw = self
            .properties
            .get_property(object, &design_note_key(), false);
        let ancestors = self.traits.get_ancestors(object);

        let mut state = self.state.borrow_mut();
        let entry = state.entries.entry(object).or_default();
        entry.raw_values = match &raw {
            Some(Value::Str(text)) => parse_design_note(text),
            _ => BTreeMap::new(),
        };
        entry.existent = matches!(&raw, Some(Value::Str(text)) if !text.is_empty());
        entry.ancestors = ancestors;
        entry.cached = true;
    }

    /// Resolves one parameter, walking the ancestor chain when `inherit` is
    /// set and the object has no local value. Ancestors visited during
    /// resolution are retained in cache.
    pub fn get(&self, object: ObjectId, parameter: &str, inherit: bool) -> Option<String> {
        let key = fold(parameter);
        self.update_entry(object);
        {
            let state = self.state.borrow();
            if let Some(value) = state
                .entries
                .get(&object)
                .and_then(|entry| entry.raw_values.get(&key))
            {
                return Some(value.clone());
            }
        }
        if !inherit {
            return None;
        }

        let ancestors = self
            .state
            .borrow()
            .entries
            .get(&object)
            .map(|entry| entry.ancestors.clone())
            .unwrap_or_default();
        for ancestor in ancestors {
            self.update_entry(ancestor);
            let mut state = self.state.borrow_mut();
            if let Some(entry) = state.entries.get_mut(&ancestor) {
                entry.relevant = true;
                if let Some(value) = entry.raw_values.get(&key) {
                    return Some(value.clone());
                }
            }
        }
        None
    }

    pub fn exists(&self, object: ObjectId, parameter: &str, inherit: bool) -> bool {
        self.get(object, parameter, inherit).is_some()
    }

    /// Sets one named parameter and writes the re-encoded string back to the
    /// store in a single round-trip.
    pub fn set(
        &self,
        object: ObjectId,
        parameter: &str,
        value: &str,
    ) -> Result<(), ScriptBindError> {
        self.update_entry(object);
        {
            let mut state = self.state.borrow_mut();
            let entry = state.entries.entry(object).or_default();
            entry.raw_values.insert(fold(parameter), value.to_string());
        }
        self.write_entry(object)?;
        self.flag_watchers(object);
        Ok(())
    }

    /// Copies the resolved value of a parameter from one object to another.
    /// Reports whether the source had a value to copy.
    pub fn copy(
        &self,
        source: ObjectId,
        dest: ObjectId,
        parameter: &str,
    ) -> Result<bool, ScriptBindError> {
        match self.get(source, parameter, true) {
            Some(value) => {
                self.set(dest, parameter, &value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, object: ObjectId, parameter: &str) -> Result<bool, ScriptBindError> {
        self.update_entry(object);
        let removed = {
            let mut state = self.state.borrow_mut();
            state
                .entries
                .entry(object)
                .or_default()
                .raw_values
                .remove(&fold(parameter))
                .is_some()
        };
        if removed {
            self.write_entry(object)?;
            self.flag_watchers(object);
        }
        Ok(removed)
    }

    fn write_entry(&self, object: ObjectId) -> Result<(), ScriptBindError> {
        let (encoded, empty) = {
            let state = self.state.borrow();
            let entry = match state.entries.get(&object) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            (
                encode_design_note(&entry.raw_values),
                entry.raw_values.is_empty(),
            )
        };

        self.state.borrow_mut().current = object;
        let result = if empty {
            self.properties.remove_property(object, &design_note_key())
        } else {
            self.properties
                .set_property(object, &design_note_key(), Value::from(encoded))
        };
        let mut state = self.state.borrow_mut();
        state.current = ObjectId::NONE;
        if let Some(entry) = state.entries.get_mut(&object) {
            entry.existent = !empty;
        }
        result
    }

    /// Registers a typed wrapper's dirty flag as a direct watcher of one
    /// object and retains the object's ancestor entries while it is watched.
    pub fn watch_object(&self, object: ObjectId, dirty: &Rc<Cell<bool>>) -> u64 {
        let id = self.next_watcher.get();
        self.next_watcher.set(id + 1);

        let ancestors = self.traits.get_ancestors(object);
        let mut state = self.state.borrow_mut();
        {
            let entry = state.entries.entry(object).or_default();
            entry.direct_watchers.insert(id, Rc::downgrade(dirty));
            entry.ancestors = ancestors.clone();
        }
        for ancestor in &ancestors {
            state.entries.entry(*ancestor).or_default().indirect_watchers += 1;
        }
        id
    }

    pub fn unwatch_object(&self, object: ObjectId, id: u64) {
        let mut state = self.state.borrow_mut();
        let ancestors = match state.entries.get_mut(&object) {
            Some(entry) => {
                entry.direct_watchers.remove(&id);
                entry.ancestors.clone()
            }
            None => Vec::new(),
        };
        for ancestor in ancestors {
            if let Some(entry) = state.entries.get_mut(&ancestor) {
                entry.indirect_watchers = entry.indirect_watchers.saturating_sub(1);
            }
            Self::evict_if_irrelevant(&mut state, ancestor);
        }
        Self::evict_if_irrelevant(&mut state, object);
    }

    fn evict_if_irrelevant(state: &mut CacheData, object: ObjectId) {
        if let Some(entry) = state.entries.get(&object) {
            if entry.direct_watchers.is_empty() && entry.indirect_watchers == 0 && !entry.relevant
            {
                state.entries.remove(&object);
            }
        }
    }

    /// Change notification for the encoded-string property. Clears the
    /// changed object's parse and flags every watcher whose resolution may
    /// pass through it; re-resolution happens lazily on next access.
    fn on_design_note_change(&self, change: &PropertyChange) {
        let mut flags = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            if change.object == state.current {
                return;
            }
            if let Some(entry) = state.entries.get_mut(&change.object) {
                entry.cached = false;
                entry.existent = false;
                entry.raw_values.clear();
                flags.extend(entry.direct_watchers.values().cloned());
            }
            for (object, entry) in state.entries.iter() {
                if *object != change.object && entry.ancestors.contains(&change.object) {
                    flags.extend(entry.direct_watchers.values().cloned());
                }
            }
        }
        for flag in flags {
            if let Some(flag) = flag.upgrade() {
                flag.set(true);
            }
        }
    }

    /// Flags watchers after a mutation through the cache itself (the store's
    /// own change notification is suppressed by the `current` guard).
    fn flag_watchers(&self, object: ObjectId) {
        let mut flags = Vec::new();
        {
            let state = self.state.borrow();
            if let Some(entry) = state.entries.get(&object) {
                flags.extend(entry.direct_watchers.values().cloned());
            }
            for (other, entry) in state.entries.iter() {
                if *other != object && entry.ancestors.contains(&object) {
                    flags.extend(entry.direct_watchers.values().cloned());
                }
            }
        }
        for flag in flags {
            if let Some(flag) = flag.upgrade() {
                flag.set(true);
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.state.borrow().entries.len()
    }
}

/// String encoding of one typed parameter value.
pub trait ParamCodec: Sized + Clone {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError>;
    fn to_raw(&self) -> String;
}

fn parse_error(raw: &str, ty: &str) -> ScriptBindError {
    ScriptBindError::new(
        "PARAM_PARSE",
        format!("Cannot parse parameter value \"{}\" as {}.", raw, ty),
    )
}

impl ParamCodec for String {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        Ok(raw.to_string())
    }

    fn to_raw(&self) -> String {
        self.clone()
    }
}

impl ParamCodec for bool {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(parse_error(raw, "bool")),
        }
    }

    fn to_raw(&self) -> String {
        if *self { "true" } else { "false" }.to_string()
    }
}

impl ParamCodec for i32 {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.trim().parse().map_err(|_| parse_error(raw, "i32"))
    }

    fn to_raw(&self) -> String {
        self.to_string()
    }
}

impl ParamCodec for u32 {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.trim().parse().map_err(|_| parse_error(raw, "u32"))
    }

    fn to_raw(&self) -> String {
        self.to_string()
    }
}

impl ParamCodec for f32 {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.trim().parse().map_err(|_| parse_error(raw, "f32"))
    }

    fn to_raw(&self) -> String {
        self.to_string()
    }
}

impl ParamCodec for Time {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.parse()
    }

    fn to_raw(&self) -> String {
        self.millis().to_string()
    }
}

impl ParamCodec for Vector {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.parse()
    }

    fn to_raw(&self) -> String {
        format!("{},{},{}", self.x, self.y, self.z)
    }
}

impl ParamCodec for ObjectId {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.trim()
            .parse()
            .map(ObjectId)
            .map_err(|_| parse_error(raw, "ObjectId"))
    }

    fn to_raw(&self) -> String {
        self.0.to_string()
    }
}

impl ParamCodec for Curve {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.parse()
    }

    fn to_raw(&self) -> String {
        self.code().to_string()
    }
}

impl ParamCodec for LogLevel {
    fn from_raw(raw: &str) -> Result<Self, ScriptBindError> {
        raw.parse()
    }

    fn to_raw(&self) -> String {
        self.code().to_string()
    }
}

/// Typed view of one named parameter on one object, resolved with inheritance
/// and re-read lazily after the cache flags a possible change.
pub struct Parameter<T: ParamCodec> {
    cache: Rc<ParameterCache>,
    object: ObjectId,
    name: String,
    default: Option<T>,
    dirty: Rc<Cell<bool>>,
    watcher: u64,
    value: RefCell<Option<T>>,
}

impl<T: ParamCodec> Parameter<T> {
    pub fn new(
        cache: Rc<ParameterCache>,
        object: ObjectId,
        name: impl Into<String>,
        default: Option<T>,
    ) -> Self {
        let name = name.into();
        let dirty = Rc::new(Cell::new(true));
        let watcher = cache.watch_object(object, &dirty);
        Self {
            cache,
            object,
            name,
            default,
            dirty,
            watcher,
            value: RefCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> Result<T, ScriptBindError> {
        if !self.dirty.get() {
            if let Some(value) = self.value.borrow().clone() {
                return Ok(value);
            }
        }
        self.dirty.set(false);

        match self.cache.get(self.object, &self.name, true) {
            Some(raw) => match T::from_raw(&raw) {
                Ok(value) => {
                    *self.value.borrow_mut() = Some(value.clone());
                    Ok(value)
                }
                Err(error) => match &self.default {
                    Some(default) => Ok(default.clone()),
                    None => Err(error),
                },
            },
            None => match &self.default {
                Some(default) => {
                    *self.value.borrow_mut() = Some(default.clone());
                    Ok(default.clone())
                }
                None => Err(ScriptBindError::missing_resource(
                    "parameter",
                    &self.name,
                    self.object,
                )),
            },
        }
    }

    pub fn set(&self, value: T) -> Result<(), ScriptBindError> {
        self.cache.set(self.object, &self.name, &value.to_raw())?;
        *self.value.borrow_mut() = Some(value);
        self.dirty.set(false);
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.cache.exists(self.object, &self.name, true)
    }

    pub fn exists_locally(&self) -> bool {
        self.cache.exists(self.object, &self.name, false)
    }

    pub fn remove(&self) -> Result<bool, ScriptBindError> {
        *self.value.borrow_mut() = None;
        self.dirty.set(true);
        self.cache.remove(self.object, &self.name)
    }
}

impl<T: ParamCodec> Drop for Parameter<T> {
    fn drop(&mut self) {
        self.cache.unwatch_object(self.object, self.watcher);
    }
}
