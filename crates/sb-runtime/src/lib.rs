pub mod memory;
pub mod message;
pub mod params;
pub mod persist;
pub mod property;
pub mod script;
pub mod services;
pub mod transition;
pub mod trap;

pub use memory::MemoryEngine;
pub use message::{
    DataSlot, GoalState, Message, MessageRecord, ObjectiveChange, ObjectiveField, Payload,
    SimEvent, Timer,
};
pub use params::{ParamCodec, Parameter, ParameterCache};
pub use persist::Persistent;
pub use property::{FieldAccess, FieldFamily, FieldSpec, FieldValue, PropField, ScriptHost};
pub use script::{Flow, HandlerId, LogLevel, Script};
pub use services::{
    EngineHandle, InheritanceGraph, LinkRecord, LinkStore, MessageTransport, PropertyChange,
    PropertyKey, PropertyListener, PropertyStore, QuestStore, Reply, ScriptDataStore,
    ScriptDataTag, ScriptReceiver, TimerId,
};
pub use transition::Transition;
pub use trap::{build_trap_trigger, trigger, TrapTiming, TrapTriggerOptions};
