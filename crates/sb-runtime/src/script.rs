use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::str::FromStr;

use sb_core::{FromValue, ObjectId, ScriptBindError, Time, Value};

use crate::message::{Message, MessageRecord, SimEvent, Timer};
use crate::params::{ParamCodec, Parameter};
use crate::persist::Persistent;
use crate::property::ScriptHost;
use crate::services::{
    EngineHandle, InheritanceGraph, LinkStore, MessageTransport, QuestStore, Reply, ScriptDataTag,
    ScriptReceiver,
};

/// Script log severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Verbose,
    Normal,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn code(self) -> &'static str {
        match self {
            LogLevel::Verbose => "verbose",
            LogLevel::Normal => "normal",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }

    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Verbose => log::Level::Trace,
            LogLevel::Normal => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ScriptBindError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.to_ascii_lowercase().as_str() {
            "verbose" | "verb" => Ok(LogLevel::Verbose),
            "normal" | "norm" => Ok(LogLevel::Normal),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" | "err" => Ok(LogLevel::Error),
            _ => Err(ScriptBindError::new(
                "ENUM_CODE",
                format!("Invalid log level code \"{}\".", code),
            )),
        }
    }
}

/// Per-handler dispatch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Proceed to the next handler in this pass.
    Continue,
    /// Stop this pass, keeping its accumulated result.
    Halt,
    /// Mark the pass failed but keep invoking the remaining handlers.
    Error,
}

pub type Handler = Rc<dyn Fn(&Script, &Message) -> Result<Flow, ScriptBindError>>;
pub type Hook = Rc<dyn Fn(&Script) -> Result<(), ScriptBindError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Multi-valued mapping from case-folded name to handlers in registration
/// order.
#[derive(Default)]
struct HandlerTable {
    buckets: BTreeMap<String, Vec<(HandlerId, Handler)>>,
}

impl HandlerTable {
    fn insert(&mut self, name: &str, id: HandlerId, handler: Handler) {
        self.buckets
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push((id, handler));
    }

    fn matching(&self, name: &str) -> Vec<Handler> {
        self.buckets
            .get(&name.to_ascii_lowercase())
            .map(|bucket| bucket.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    fn remove(&mut self, id: HandlerId) -> bool {
        for bucket in self.buckets.values_mut() {
            if let Some(position) = bucket.iter().position(|(entry, _)| *entry == id) {
                bucket.remove(position);
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// One script instance bound to a host object.
///
/// Interior mutability throughout: the engine's call model is single-threaded
/// but re-entrant, so `dispatch` takes `&self` and a handler may send a
/// message that is delivered back to the same instance before the outer
/// dispatch returns.
pub struct Script {
    script_name: String,
    host: ObjectId,
    engine: EngineHandle,
    min_level: Cell<LogLevel>,
    initialized: Cell<bool>,
    sim: Cell<bool>,
    post_sim: Cell<bool>,
    sim_time: Cell<Time>,
    next_handler: Cell<u64>,
    message_handlers: RefCell<HandlerTable>,
    timer_handlers: RefCell<HandlerTable>,
    init_hooks: RefCell<Vec<Hook>>,
    teardown_hooks: RefCell<Vec<Hook>>,
}

impl Script {
    pub fn new(
        script_name: impl Into<String>,
        host: ObjectId,
        engine: &EngineHandle,
        min_level: LogLevel,
    ) -> Rc<Self> {
        Rc::new(Self {
            script_name: script_name.into(),
            host,
            engine: engine.clone(),
            min_level: Cell::new(min_level),
            initialized: Cell::new(false),
            sim: Cell::new(engine.transport.sim_running()),
            post_sim: Cell::new(false),
            sim_time: Cell::new(Time::ZERO),
            next_handler: Cell::new(1),
            message_handlers: RefCell::new(HandlerTable::default()),
            timer_handlers: RefCell::new(HandlerTable::default()),
            init_hooks: RefCell::new(Vec::new()),
            teardown_hooks: RefCell::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.script_name
    }

    pub fn host(&self) -> ObjectId {
        self.host
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn script_host(&self) -> ScriptHost {
        ScriptHost::new(self.engine.properties.clone(), self.host)
    }

    pub fn sim_time(&self) -> Time {
        self.sim_time.get()
    }

    pub fn is_sim(&self) -> bool {
        self.sim.get()
    }

    fn next_handler_id(&self) -> HandlerId {
        let id = self.next_handler.get();
        self.next_handler.set(id + 1);
        HandlerId(id)
    }

    pub fn listen_message(
        &self,
        name: &str,
        handler: impl Fn(&Script, &Message) -> Result<Flow, ScriptBindError> + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id();
        self.message_handlers
            .borrow_mut()
            .insert(name, id, Rc::new(handler));
        id
    }

    pub fn listen_timer(
        &self,
        timer: &str,
        handler: impl Fn(&Script, &Message) -> Result<Flow, ScriptBindError> + 'static,
    ) -> HandlerId {
        let id = self.next_handler_id();
        self.timer_handlers
            .borrow_mut()
            .insert(timer, id, Rc::new(handler));
        id
    }

    /// Unregisters a timer handler; the removal half of the
    /// register-on-construction / unregister-on-drop contract used by
    /// [`crate::transition::Transition`].
    pub fn forget_timer(&self, id: HandlerId) -> bool {
        self.timer_handlers.borrow_mut().remove(id)
    }

    pub fn on_initialize(&self, hook: impl Fn(&Script) -> Result<(), ScriptBindError> + 'static) {
        self.init_hooks.borrow_mut().push(Rc::new(hook));
    }

    pub fn on_deinitialize(
        &self,
        hook: impl Fn(&Script) -> Result<(), ScriptBindError> + 'static,
    ) {
        self.teardown_hooks.borrow_mut().push(Rc::new(hook));
    }

    pub fn parameter<T: ParamCodec>(&self, name: &str, default: Option<T>) -> Parameter<T> {
        Parameter::new(self.engine.params.clone(), self.host, name, default)
    }

    pub fn persistent<T: FromValue + Into<Value> + Clone>(&self, name: &str) -> Persistent<T> {
        Persistent::new(
            self.engine.script_data.clone(),
            ScriptDataTag {
                host: self.host,
                script: self.script_name.clone(),
                name: name.to_string(),
            },
            None,
        )
    }

    pub fn persistent_with_default<T: FromValue + Into<Value> + Clone>(
        &self,
        name: &str,
        default: T,
    ) -> Persistent<T> {
        Persistent::new(
            self.engine.script_data.clone(),
            ScriptDataTag {
                host: self.host,
                script: self.script_name.clone(),
                name: name.to_string(),
            },
            Some(default),
        )
    }

    pub fn start_timer(&self, timer: &str, delay: Time, repeating: bool) -> Timer {
        MessageRecord::timer(timer).schedule(&self.engine, self.host, self.host, delay, repeating)
    }

    pub fn start_timer_with_data(
        &self,
        timer: &str,
        delay: Time,
        repeating: bool,
        data: impl Into<Value>,
    ) -> Timer {
        MessageRecord::timer(timer).with_data1(data).schedule(
            &self.engine,
            self.host,
            self.host,
            delay,
            repeating,
        )
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        if level < self.min_level.get() {
            return;
        }
        let millis = self.sim_time.get().millis();
        log::log!(
            target: "scriptbind",
            level.to_log(),
            "[{:>4}.{:03}] {} [{}]: {}",
            millis / 1000,
            millis % 1000,
            self.script_name,
            self.host,
            message.as_ref()
        );
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level.get()
    }

    /// Routes one raw message through lifecycle bootstrap, the cross-cutting
    /// synthesized messages, and the handler fan-out passes.
    pub fn dispatch(
        &self,
        record: Rc<MessageRecord>,
        reply: Option<Reply>,
    ) -> Result<bool, ScriptBindError> {
        self.sim_time.set(record.time);
        let name = record.name.clone();

        // High-frequency and semantically inert outside the simulation.
        if !self.sim.get() && name.eq_ignore_ascii_case("PhysMadeNonPhysical") {
            return Ok(true);
        }

        self.log(LogLevel::Verbose, format!("Got message \"{}\".", name));

        if !self.initialized.get() && !name.eq_ignore_ascii_case("EndScript") {
            self.initialize()?;
            self.initialized.set(true);
        }

        let message = Message::from_record(record, reply);

        if name.eq_ignore_ascii_case("Sim") {
            if let Ok(event) = message.sim_event() {
                let starting = event == SimEvent::Start;
                self.sim.set(starting);
                if starting {
                    MessageRecord::generic("PostSim").post(&self.engine, self.host, self.host);
                }
            }
        }

        if name.eq_ignore_ascii_case("PostSim") {
            if self.post_sim.get() {
                // Only handle one instance of the message.
                return Ok(true);
            }
            self.post_sim.set(true);
            self.fix_player_links()?;
        }

        let mut result = self.dispatch_cycle(&self.message_handlers, &name, &message);

        if name.eq_ignore_ascii_case("QuestChange") && message.objective_change().is_ok() {
            result &= self.dispatch_cycle(&self.message_handlers, "ObjectiveChange", &message);
        }

        if name.eq_ignore_ascii_case("Timer") {
            if let Ok(timer_name) = message.timer_name() {
                let timer_name = timer_name.to_string();
                result &= self.dispatch_cycle(&self.timer_handlers, &timer_name, &message);
            }
        }

        if self.initialized.get() && name.eq_ignore_ascii_case("EndScript") {
            self.deinitialize()?;
            self.initialized.set(false);
        }

        Ok(result)
    }

    fn dispatch_cycle(
        &self,
        table: &RefCell<HandlerTable>,
        key: &str,
        message: &Message,
    ) -> bool {
        let handlers = table.borrow().matching(key);
        let mut cycle_result = true;

        for handler in handlers {
            let result = match handler(self, message) {
                Ok(flow) => flow,
                Err(error) => {
                    self.log(LogLevel::Error, error.to_string());
                    Flow::Error
                }
            };
            match result {
                Flow::Continue => {}
                Flow::Halt => return cycle_result,
                // A handler that reported an error without failing has
                // already logged.
                Flow::Error => cycle_result = false,
            }
        }

        cycle_result
    }

    fn initialize(&self) -> Result<(), ScriptBindError> {
        // The "debug" parameter or quest variable adjusts the minimum
        // logging level.
        let debug_param: Parameter<LogLevel> = self.parameter("debug", None);
        if debug_param.exists() {
            if let Ok(level) = debug_param.get() {
                self.min_level.set(level);
            }
        } else {
            match self.engine.quests.quest_get("debug") {
                2 => self.min_level.set(LogLevel::Verbose),
                1 => {
                    if self.min_level.get() != LogLevel::Verbose {
                        self.min_level.set(LogLevel::Normal);
                    }
                }
                -1 => {
                    if self.min_level.get() < LogLevel::Warning {
                        self.min_level.set(LogLevel::Info);
                    }
                }
                -2 => {
                    if self.min_level.get() < LogLevel::Error {
                        self.min_level.set(LogLevel::Warning);
                    }
                }
                _ => {}
            }
        }

        let hooks = self.init_hooks.borrow().clone();
        for hook in hooks {
            hook(self)?;
        }
        Ok(())
    }

    fn deinitialize(&self) -> Result<(), ScriptBindError> {
        let hooks = self.teardown_hooks.borrow().clone();
        for hook in hooks {
            hook(self)?;
        }
        Ok(())
    }

    /// One-time post-simulation-start fixup: links held against the player
    /// start marker are transferred to the real player object.
    fn fix_player_links(&self) -> Result<(), ScriptBindError> {
        let start = match self
            .engine
            .links
            .get_links(Some("PlayerFactory"), ObjectId::NONE, ObjectId::NONE)
            .first()
        {
            Some(link) => link.source,
            None => return Ok(()),
        };
        let player = match self.engine.traits.object_named("Player") {
            Some(player) => player,
            None => return Ok(()),
        };

        for link in self.engine.links.get_links(None, self.host, start) {
            self.log(
                LogLevel::Normal,
                format!(
                    "Transferring a {} link with source {} from destination {} to {}.",
                    link.flavor, self.host, start, player
                ),
            );
            self.engine
                .links
                .create_link(&link.flavor, self.host, player, link.data.clone());
            self.engine.links.destroy_link(link.id);
        }
        Ok(())
    }

    #[cfg(test)]
    fn timer_handler_count(&self) -> usize {
        self.timer_handlers.borrow().len()
    }
}

impl ScriptReceiver for Script {
    fn class_name(&self) -> &str {
        &self.script_name
    }

    /// Top-level dispatch boundary: never panics the engine loop over a
    /// script failure; errors are logged and reported as "not handled".
    fn receive(&self, record: Rc<MessageRecord>, reply: Option<Reply>) -> bool {
        match self.dispatch(record, reply) {
            Ok(result) => result,
            Err(error) => {
                self.log(LogLevel::Error, error.to_string());
                false
            }
        }
    }
}
