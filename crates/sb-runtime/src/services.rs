use std::cell::RefCell;
use std::rc::Rc;

use sb_core::{ObjectId, ScriptBindError, Time, Value};

use crate::message::MessageRecord;
use crate::params::ParameterCache;

/// Two-part property identifier: a major category plus an optional sub-key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyKey {
    pub major: String,
    pub minor: Option<String>,
}

impl PropertyKey {
    pub fn new(major: impl Into<String>) -> Self {
        Self {
            major: major.into(),
            minor: None,
        }
    }

    pub fn with_minor(major: impl Into<String>, minor: impl Into<String>) -> Self {
        Self {
            major: major.into(),
            minor: Some(minor.into()),
        }
    }
}

/// Handle to a pending scheduled delivery owned by the engine's timer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub i32);

/// Directed, flavored relationship between two objects.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkRecord {
    pub id: u64,
    pub flavor: String,
    pub source: ObjectId,
    pub dest: ObjectId,
    pub data: Value,
}

/// Key of one persistent script variable: (host object, script name, variable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptDataTag {
    pub host: ObjectId,
    pub script: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct PropertyChange {
    pub object: ObjectId,
    pub key: PropertyKey,
    pub inherited: bool,
}

pub type PropertyListener = Box<dyn Fn(&PropertyChange)>;

/// Reply slot shared between the dispatcher and handlers.
pub type Reply = Rc<RefCell<Value>>;

/// The engine's transactional object property store. Reads can resolve
/// through the object's inheritance ancestry; writes always land on the
/// object itself.
pub trait PropertyStore {
    fn get_property(&self, object: ObjectId, key: &PropertyKey, inherit: bool) -> Option<Value>;
    fn set_property(
        &self,
        object: ObjectId,
        key: &PropertyKey,
        value: Value,
    ) -> Result<(), ScriptBindError>;
    fn property_exists(&self, object: ObjectId, key: &PropertyKey, inherit: bool) -> bool;
    fn remove_property(&self, object: ObjectId, key: &PropertyKey) -> Result<(), ScriptBindError>;

    /// Registers a listener for changes to any property with the given major
    /// key, on any object.
    fn subscribe_property(&self, major: &str, listener: PropertyListener);
}

/// The engine's archetype/meta-property hierarchy.
pub trait InheritanceGraph {
    /// Ancestors of an object, nearest first.
    fn get_ancestors(&self, object: ObjectId) -> Vec<ObjectId>;
    fn object_named(&self, name: &str) -> Option<ObjectId>;
}

pub trait LinkStore {
    /// Links matching a flavor (`None` for any) and endpoints
    /// (`ObjectId::NONE` as wildcard).
    fn get_links(&self, flavor: Option<&str>, source: ObjectId, dest: ObjectId) -> Vec<LinkRecord>;
    fn create_link(&self, flavor: &str, source: ObjectId, dest: ObjectId, data: Value) -> u64;
    fn destroy_link(&self, id: u64);
}

/// Synchronous/asynchronous message delivery owned by the engine.
pub trait MessageTransport {
    fn send(&self, record: Rc<MessageRecord>, reply: Option<Reply>) -> bool;
    fn post(&self, record: MessageRecord);
    fn schedule(&self, record: MessageRecord, delay: Time, repeating: bool) -> TimerId;
    /// Best-effort: dropping an already-fired timer is a no-op.
    fn cancel_timer(&self, timer: TimerId);
    fn sim_time(&self) -> Time;
    fn sim_running(&self) -> bool;
}

/// Per-object script variable store.
pub trait ScriptDataStore {
    fn is_set(&self, tag: &ScriptDataTag) -> bool;
    fn get(&self, tag: &ScriptDataTag) -> Result<Value, ScriptBindError>;
    fn set(&self, tag: &ScriptDataTag, value: Value) -> Result<(), ScriptBindError>;
    fn clear(&self, tag: &ScriptDataTag) -> Result<Value, ScriptBindError>;
}

pub trait QuestStore {
    /// Unset quest variables read as zero.
    fn quest_get(&self, name: &str) -> i32;
    fn quest_set(&self, name: &str, value: i32);
    fn quest_exists(&self, name: &str) -> bool;
    fn quest_delete(&self, name: &str);
}

/// Engine-facing entry point of one script instance.
pub trait ScriptReceiver {
    fn class_name(&self) -> &str;
    fn receive(&self, record: Rc<MessageRecord>, reply: Option<Reply>) -> bool;
}

/// Cheap-clone bundle of the engine service views one script binds against.
#[derive(Clone)]
pub struct EngineHandle {
    pub properties: Rc<dyn PropertyStore>,
    pub traits: Rc<dyn InheritanceGraph>,
    pub links: Rc<dyn LinkStore>,
    pub transport: Rc<dyn MessageTransport>,
    pub script_data: Rc<dyn ScriptDataStore>,
    pub quests: Rc<dyn QuestStore>,
    pub params: Rc<ParameterCache>,
}

impl EngineHandle {
    pub fn new<E>(engine: Rc<E>) -> Self
    where
        E: PropertyStore
            + InheritanceGraph
            + LinkStore
            + MessageTransport
            + ScriptDataStore
            + QuestStore
            + 'static,
    {
        let properties: Rc<dyn PropertyStore> = engine.clone();
        let traits: Rc<dyn InheritanceGraph> = engine.clone();
        let params = ParameterCache::new(properties.clone(), traits.clone());
        Self {
            properties,
            traits,
            links: engine.clone(),
            transport: engine.clone(),
            script_data: engine.clone(),
            quests: engine,
            params,
        }
    }
}
