use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use sb_core::{FromValue, ObjectId, ScriptBindError, Time, Value};

use crate::services::{EngineHandle, LinkStore, MessageTransport, Reply, TimerId};

/// Shape-specific portion of a message record, beyond the three generic data
/// slots every message carries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    Generic,
    Sim {
        starting: bool,
    },
    Timer {
        timer_name: String,
    },
    QuestChange {
        quest_var: String,
        new_value: i32,
        old_value: i32,
    },
}

/// Raw message record exchanged with the engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageRecord {
    pub name: String,
    pub from: ObjectId,
    pub to: ObjectId,
    pub time: Time,
    pub data1: Value,
    pub data2: Value,
    pub data3: Value,
    pub payload: Payload,
}

impl MessageRecord {
    pub fn generic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn sim(starting: bool) -> Self {
        Self {
            name: "Sim".to_string(),
            payload: Payload::Sim { starting },
            ..Self::default()
        }
    }

    pub fn timer(timer_name: impl Into<String>) -> Self {
        Self {
            name: "Timer".to_string(),
            payload: Payload::Timer {
                timer_name: timer_name.into(),
            },
            ..Self::default()
        }
    }

    pub fn quest_change(quest_var: impl Into<String>, new_value: i32, old_value: i32) -> Self {
        Self {
            name: "QuestChange".to_string(),
            payload: Payload::QuestChange {
                quest_var: quest_var.into(),
                new_value,
                old_value,
            },
            ..Self::default()
        }
    }

    pub fn with_data1(mut self, value: impl Into<Value>) -> Self {
        self.data1 = value.into();
        self
    }

    pub fn with_data2(mut self, value: impl Into<Value>) -> Self {
        self.data2 = value.into();
        self
    }

    pub fn with_data3(mut self, value: impl Into<Value>) -> Self {
        self.data3 = value.into();
        self
    }

    /// Delivers the message now; the result is the receiving scripts'
    /// aggregate dispatch result.
    pub fn send(mut self, engine: &EngineHandle, from: ObjectId, to: ObjectId) -> bool {
        self.from = from;
        self.to = to;
        self.time = engine.transport.sim_time();
        engine.transport.send(Rc::new(self), None)
    }

    pub fn send_with_reply(
        mut self,
        engine: &EngineHandle,
        from: ObjectId,
        to: ObjectId,
        reply: Reply,
    ) -> bool {
        self.from = from;
        self.to = to;
        self.time = engine.transport.sim_time();
        engine.transport.send(Rc::new(self), Some(reply))
    }

    /// Enqueues the message for asynchronous redelivery by the engine.
    pub fn post(mut self, engine: &EngineHandle, from: ObjectId, to: ObjectId) {
        self.from = from;
        self.to = to;
        engine.transport.post(self);
    }

    pub fn schedule(
        mut self,
        engine: &EngineHandle,
        from: ObjectId,
        to: ObjectId,
        delay: Time,
        repeating: bool,
    ) -> Timer {
        self.from = from;
        self.to = to;
        Timer::new(engine.transport.schedule(self, delay, repeating))
    }

    /// Sends (or schedules, when a delay is given) one copy of this message
    /// along every current link of the flavor.
    pub fn broadcast(&self, engine: &EngineHandle, from: ObjectId, flavor: &str, delay: Time) {
        for link in engine
            .links
            .get_links(Some(flavor), from, ObjectId::NONE)
        {
            if delay > Time::ZERO {
                self.clone()
                    .schedule(engine, link.source, link.dest, delay, false);
            } else {
                self.clone().send(engine, link.source, link.dest);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSlot {
    Data1,
    Data2,
    Data3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Start,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveField {
    State,
    Visible,
    Final,
    Irreversible,
    Reverse,
}

impl ObjectiveField {
    fn from_code(code: &str) -> Option<Self> {
        match code.to_ascii_lowercase().as_str() {
            "state" => Some(Self::State),
            "visible" => Some(Self::Visible),
            "final" => Some(Self::Final),
            "irreversible" => Some(Self::Irreversible),
            "reverse" => Some(Self::Reverse),
            _ => None,
        }
    }
}

/// Completion state of a mission objective, as encoded in the `state` field's
/// quest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalState {
    Incomplete,
    Complete,
    Inactive,
    Failed,
}

impl GoalState {
    pub fn from_raw(raw: i32) -> Result<Self, ScriptBindError> {
        match raw {
            0 => Ok(Self::Incomplete),
            1 => Ok(Self::Complete),
            2 => Ok(Self::Inactive),
            3 => Ok(Self::Failed),
            _ => Err(ScriptBindError::new(
                "ENUM_CODE",
                format!("Invalid goal state {}.", raw),
            )),
        }
    }
}

/// A quest-variable change reinterpreted as a mission objective change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectiveChange {
    pub objective: u32,
    pub field: ObjectiveField,
    pub new_raw: i32,
    pub old_raw: i32,
}

impl ObjectiveChange {
    /// The new value as a completion state; only the `state` field carries
    /// one.
    pub fn new_state(&self) -> Result<GoalState, ScriptBindError> {
        GoalState::from_raw(self.new_raw)
    }

    pub fn old_state(&self) -> Result<GoalState, ScriptBindError> {
        GoalState::from_raw(self.old_raw)
    }
}

/// Typed wrapper over one raw message record plus its reply slot. The reply
/// is borrowed from the dispatching caller, or owned locally when the caller
/// supplied none.
pub struct Message {
    record: Rc<MessageRecord>,
    reply: Reply,
}

impl Message {
    pub fn from_record(record: Rc<MessageRecord>, reply: Option<Reply>) -> Self {
        Self {
            record,
            reply: reply.unwrap_or_else(|| Rc::new(RefCell::new(Value::Empty))),
        }
    }

    pub fn record(&self) -> &Rc<MessageRecord> {
        &self.record
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn from(&self) -> ObjectId {
        self.record.from
    }

    pub fn to(&self) -> ObjectId {
        self.record.to
    }

    pub fn time(&self) -> Time {
        self.record.time
    }

    fn data(&self, slot: DataSlot) -> &Value {
        match slot {
            DataSlot::Data1 => &self.record.data1,
            DataSlot::Data2 => &self.record.data2,
            DataSlot::Data3 => &self.record.data3,
        }
    }

    pub fn has_data(&self, slot: DataSlot) -> bool {
        !self.data(slot).is_empty()
    }

    pub fn get_data(&self, slot: DataSlot) -> Value {
        self.data(slot).clone()
    }

    pub fn data_as<T: FromValue>(&self, slot: DataSlot) -> Result<T, ScriptBindError> {
        T::from_value(self.data(slot))
    }

    /// Decodes one data slot, falling back to a default when the slot is
    /// empty. A populated slot of the wrong kind is still an error.
    pub fn data_or<T: FromValue>(&self, slot: DataSlot, default: T) -> Result<T, ScriptBindError> {
        let data = self.data(slot);
        if data.is_empty() {
            Ok(default)
        } else {
            T::from_value(data)
        }
    }

    pub fn get_reply(&self) -> Value {
        self.reply.borrow().clone()
    }

    pub fn set_reply(&self, value: impl Into<Value>) {
        *self.reply.borrow_mut() = value.into();
    }

    pub fn reply_slot(&self) -> Reply {
        self.reply.clone()
    }

    pub fn sim_event(&self) -> Result<SimEvent, ScriptBindError> {
        match &self.record.payload {
            Payload::Sim { starting: true } => Ok(SimEvent::Start),
            Payload::Sim { starting: false } => Ok(SimEvent::Finish),
            _ => Err(ScriptBindError::message_wrap(
                self.name(),
                "a simulation start/stop message",
                "wrong message shape",
            )),
        }
    }

    pub fn timer_name(&self) -> Result<&str, ScriptBindError> {
        match &self.record.payload {
            Payload::Timer { timer_name } => Ok(timer_name),
            _ => Err(ScriptBindError::message_wrap(
                self.name(),
                "a timer message",
                "wrong message shape",
            )),
        }
    }

    pub fn quest_change(&self) -> Result<(&str, i32, i32), ScriptBindError> {
        match &self.record.payload {
            Payload::QuestChange {
                quest_var,
                new_value,
                old_value,
            } => Ok((quest_var, *new_value, *old_value)),
            _ => Err(ScriptBindError::message_wrap(
                self.name(),
                "a quest-variable change message",
                "wrong message shape",
            )),
        }
    }

    /// Reinterprets a quest-variable change as an objective change. Quest
    /// variables named `goal_<field>_<number>` are objective-related; any
    /// other variable fails to reinterpret.
    pub fn objective_change(&self) -> Result<ObjectiveChange, ScriptBindError> {
        let (quest_var, new_value, old_value) = self.quest_change()?;
        let wrap_error = |problem| {
            ScriptBindError::message_wrap(self.name(), "an objective change message", problem)
        };

        let rest = quest_var
            .strip_prefix("goal_")
            .ok_or_else(|| wrap_error("the quest variable is not objective-related"))?;
        let (field_code, number) = rest
            .rsplit_once('_')
            .ok_or_else(|| wrap_error("the quest variable has no objective number"))?;
        let field = ObjectiveField::from_code(field_code)
            .ok_or_else(|| wrap_error("unknown objective field"))?;
        let objective = number
            .parse()
            .map_err(|_| wrap_error("the objective number is not numeric"))?;

        Ok(ObjectiveChange {
            objective,
            field,
            new_raw: new_value,
            old_raw: old_value,
        })
    }
}

/// Cancellable handle to a scheduled future delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Timer {
    id: Option<TimerId>,
}

impl Timer {
    pub fn new(id: TimerId) -> Self {
        Self { id: Some(id) }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_some()
    }

    pub fn id(&self) -> Option<TimerId> {
        self.id
    }

    /// Invalidates the handle locally and asks the engine to drop the pending
    /// delivery. Idempotent.
    pub fn cancel(&mut self, engine: &EngineHandle) {
        if let Some(id) = self.id.take() {
            engine.transport.cancel_timer(id);
        }
    }
}

impl FromValue for Timer {
    fn from_value(value: &Value) -> Result<Self, ScriptBindError> {
        let raw = value.as_int()?;
        Ok(if raw == 0 {
            Timer::default()
        } else {
            Timer::new(TimerId(raw))
        })
    }
}

impl From<Timer> for Value {
    fn from(timer: Timer) -> Value {
        Value::Int(timer.id.map(|id| id.0).unwrap_or(0))
    }
}
