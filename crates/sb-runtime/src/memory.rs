use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use sb_core::{ObjectId, ScriptBindError, Time, Value};

use crate::message::MessageRecord;
use crate::services::{
    InheritanceGraph, LinkRecord, LinkStore, MessageTransport, PropertyChange, PropertyKey,
    PropertyListener, PropertyStore, QuestStore, Reply, ScriptDataStore, ScriptDataTag,
    ScriptReceiver, TimerId,
};

struct ObjectRecord {
    name: String,
    parents: Vec<ObjectId>,
}

struct PendingTimer {
    id: TimerId,
    due: Time,
    period: Option<Time>,
    seq: u64,
    record: MessageRecord,
}

#[derive(Default)]
struct EngineState {
    objects: BTreeMap<ObjectId, ObjectRecord>,
    next_object: i32,
    properties: HashMap<(ObjectId, PropertyKey), Value>,
    links: Vec<LinkRecord>,
    next_link: u64,
    queue: VecDeque<MessageRecord>,
    timers: Vec<PendingTimer>,
    next_timer: i32,
    next_seq: u64,
    script_data: HashMap<ScriptDataTag, Value>,
    quests: HashMap<String, i32>,
    time: Time,
    sim_running: bool,
}

/// Complete single-process implementation of the engine service traits.
/// Hosts can embed it directly; the test suites drive every behavioral test
/// through it.
pub struct MemoryEngine {
    state: RefCell<EngineState>,
    receivers: RefCell<HashMap<ObjectId, Vec<Rc<dyn ScriptReceiver>>>>,
    listeners: RefCell<Vec<(String, PropertyListener)>>,
}

impl MemoryEngine {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(EngineState {
                next_object: 1,
                next_link: 1,
                next_timer: 1,
                ..EngineState::default()
            }),
            receivers: RefCell::new(HashMap::new()),
            listeners: RefCell::new(Vec::new()),
        })
    }

    pub fn create_object(&self, name: &str, parents: &[ObjectId]) -> ObjectId {
        let mut state = self.state.borrow_mut();
        let id = ObjectId(state.next_object);
        state.next_object += 1;
        state.objects.insert(
            id,
            ObjectRecord {
                name: name.to_string(),
                parents: parents.to_vec(),
            },
        );
        id
    }

    pub fn attach_script(&self, host: ObjectId, script: Rc<dyn ScriptReceiver>) {
        self.receivers.borrow_mut().entry(host).or_default().push(script);
    }

    pub fn detach_scripts(&self, host: ObjectId) {
        self.receivers.borrow_mut().remove(&host);
    }

    pub fn add_link(&self, flavor: &str, source: ObjectId, dest: ObjectId, data: Value) -> u64 {
        self.create_link(flavor, source, dest, data)
    }

    pub fn now(&self) -> Time {
        self.state.borrow().time
    }

    /// Marks the simulation started and delivers the start message to every
    /// attached script.
    pub fn begin_sim(&self) {
        self.state.borrow_mut().sim_running = true;
        self.deliver_to_all(MessageRecord::sim(true));
    }

    pub fn end_sim(&self) {
        self.state.borrow_mut().sim_running = false;
        self.deliver_to_all(MessageRecord::sim(false));
    }

    /// Drains the posted-message queue, delivering each record in order.
    /// Messages posted during delivery are drained too.
    pub fn pump(&self) {
        loop {
            let record = match self.state.borrow_mut().queue.pop_front() {
                Some(record) => record,
                None => return,
            };
            self.deliver(record);
        }
    }

    /// Advances the sim clock, firing scheduled deliveries that come due.
    pub fn advance(&self, delta: Time) {
        let deadline = self.now() + delta;
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let due_index = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.due <= deadline)
                    .min_by_key(|(_, timer)| (timer.due, timer.seq))
                    .map(|(index, _)| index);
                match due_index {
                    Some(index) => {
                        let timer = state.timers.remove(index);
                        state.time = timer.due;
                        if let Some(period) = timer.period {
                            let seq = state.next_seq;
                            state.next_seq += 1;
                            state.timers.push(PendingTimer {
                                id: timer.id,
                                due: timer.due + period,
                                period: Some(period),
                                seq,
                                record: timer.record.clone(),
                            });
                        }
                        Some(timer.record)
                    }
                    None => None,
                }
            };
            match next {
                Some(record) => {
                    self.deliver(record);
                }
                None => break,
            }
        }
        self.state.borrow_mut().time = deadline;
    }

    fn deliver(&self, mut record: MessageRecord) {
        record.time = self.now();
        let to = record.to;
        self.deliver_record(Rc::new(record), None, to);
    }

    fn deliver_to_all(&self, record: MessageRecord) {
        let hosts: Vec<ObjectId> = self.receivers.borrow().keys().copied().collect();
        for host in hosts {
            let mut copy = record.clone();
            copy.to = host;
            copy.time = self.now();
            self.deliver_record(Rc::new(copy), None, host);
        }
    }

    fn deliver_record(
        &self,
        record: Rc<MessageRecord>,
        reply: Option<Reply>,
        to: ObjectId,
    ) -> bool {
        let scripts: Vec<Rc<dyn ScriptReceiver>> = self
            .receivers
            .borrow()
            .get(&to)
            .map(|scripts| scripts.to_vec())
            .unwrap_or_default();
        let mut result = true;
        for script in scripts {
            result &= script.receive(record.clone(), reply.clone());
        }
        result
    }

    fn notify_property_change(&self, object: ObjectId, key: &PropertyKey) {
        let change = PropertyChange {
            object,
            key: key.clone(),
            inherited: false,
        };
        let listeners = self.listeners.borrow();
        for (major, listener) in listeners.iter() {
            if major.eq_ignore_ascii_case(&key.major) {
                listener(&change);
            }
        }
    }
}

impl PropertyStore for MemoryEngine {
    fn get_property(&self, object: ObjectId, key: &PropertyKey, inherit: bool) -> Option<Value> {
        {
            let state = self.state.borrow();
            if let Some(value) = state.properties.get(&(object, key.clone())) {
                return Some(value.clone());
            }
        }
        if !inherit {
            return None;
        }
        let state = self.state.borrow();
        for ancestor in self.get_ancestors(object) {
            if let Some(value) = state.properties.get(&(ancestor, key.clone())) {
                return Some(value.clone());
            }
        }
        None
    }

    fn set_property(
        &self,
        object: ObjectId,
        key: &PropertyKey,
        value: Value,
    ) -> Result<(), ScriptBindError> {
        self.state
            .borrow_mut()
            .properties
            .insert((object, key.clone()), value);
        self.notify_property_change(object, key);
        Ok(())
    }

    fn property_exists(&self, object: ObjectId, key: &PropertyKey, inherit: bool) -> bool {
        self.get_property(object, key, inherit).is_some()
    }

    fn remove_property(&self, object: ObjectId, key: &PropertyKey) -> Result<(), ScriptBindError> {
        let removed = self
            .state
            .borrow_mut()
            .properties
            .remove(&(object, key.clone()))
            .is_some();
        if removed {
            self.notify_property_change(object, key);
        }
        Ok(())
    }

    fn subscribe_property(&self, major: &str, listener: PropertyListener) {
        self.listeners
            .borrow_mut()
            .push((major.to_string(), listener));
    }
}

impl InheritanceGraph for MemoryEngine {
    /// Breadth-first walk of the parent graph, nearest first, deduplicated.
    fn get_ancestors(&self, object: ObjectId) -> Vec<ObjectId> {
        let state = self.state.borrow();
        let mut ancestors = Vec::new();
        let mut frontier: VecDeque<ObjectId> = state
            .objects
            .get(&object)
            .map(|record| record.parents.iter().copied().collect())
            .unwrap_or_default();
        while let Some(next) = frontier.pop_front() {
            if ancestors.contains(&next) {
                continue;
            }
            ancestors.push(next);
            if let Some(record) = state.objects.get(&next) {
                frontier.extend(record.parents.iter().copied());
            }
        }
        ancestors
    }

    fn object_named(&self, name: &str) -> Option<ObjectId> {
        self.state
            .borrow()
            .objects
            .iter()
            .find(|(_, record)| record.name == name)
            .map(|(id, _)| *id)
    }
}

impl LinkStore for MemoryEngine {
    fn get_links(&self, flavor: Option<&str>, source: ObjectId, dest: ObjectId) -> Vec<LinkRecord> {
        self.state
            .borrow()
            .links
            .iter()
            .filter(|link| {
                flavor
                    .map(|flavor| link.flavor.eq_ignore_ascii_case(flavor))
                    .unwrap_or(true)
                    && (source == ObjectId::NONE || link.source == source)
                    && (dest == ObjectId::NONE || link.dest == dest)
            })
            .cloned()
            .collect()
    }

    fn create_link(&self, flavor: &str, source: ObjectId, dest: ObjectId, data: Value) -> u64 {
        let mut state = self.state.borrow_mut();
        let id = state.next_link;
        state.next_link += 1;
        state.links.push(LinkRecord {
            id,
            flavor: flavor.to_string(),
            source,
            dest,
            data,
        });
        id
    }

    fn destroy_link(&self, id: u64) {
        self.state.borrow_mut().links.retain(|link| link.id != id);
    }
}

impl MessageTransport for MemoryEngine {
    fn send(&self, record: Rc<MessageRecord>, reply: Option<Reply>) -> bool {
        let to = record.to;
        self.deliver_record(record, reply, to)
    }

    fn post(&self, record: MessageRecord) {
        self.state.borrow_mut().queue.push_back(record);
    }

    fn schedule(&self, record: MessageRecord, delay: Time, repeating: bool) -> TimerId {
        let mut state = self.state.borrow_mut();
        let id = TimerId(state.next_timer);
        state.next_timer += 1;
        let seq = state.next_seq;
        state.next_seq += 1;
        let due = state.time + delay;
        state.timers.push(PendingTimer {
            id,
            due,
            period: repeating.then_some(delay),
            seq,
            record,
        });
        id
    }

    fn cancel_timer(&self, timer: TimerId) {
        self.state
            .borrow_mut()
            .timers
            .retain(|pending| pending.id != timer);
    }

    fn sim_time(&self) -> Time {
        self.now()
    }

    fn sim_running(&self) -> bool {
        self.state.borrow().sim_running
    }
}

impl ScriptDataStore for MemoryEngine {
    fn is_set(&self, tag: &ScriptDataTag) -> bool {
        self.state.borrow().script_data.contains_key(tag)
    }

    fn get(&self, tag: &ScriptDataTag) -> Result<Value, ScriptBindError> {
        self.state
            .borrow()
            .script_data
            .get(tag)
            .cloned()
            .ok_or_else(|| {
                ScriptBindError::new(
                    "STORE_READ",
                    format!("Could not get persistent variable \"{}\".", tag.name),
                )
            })
    }

    fn set(&self, tag: &ScriptDataTag, value: Value) -> Result<(), ScriptBindError> {
        self.state
            .borrow_mut()
            .script_data
            .insert(tag.clone(), value);
        Ok(())
    }

    fn clear(&self, tag: &ScriptDataTag) -> Result<Value, ScriptBindError> {
        self.state
            .borrow_mut()
            .script_data
            .remove(tag)
            .ok_or_else(|| {
                ScriptBindError::new(
                    "STORE_WRITE",
                    format!("Could not clear persistent variable \"{}\".", tag.name),
                )
            })
    }
}

impl QuestStore for MemoryEngine {
    fn quest_get(&self, name: &str) -> i32 {
        self.state
            .borrow()
            .quests
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Sets the variable and delivers the change notification to every
    /// attached script.
    fn quest_set(&self, name: &str, value: i32) {
        let old_value = {
            let mut state = self.state.borrow_mut();
            state.quests.insert(name.to_string(), value).unwrap_or(0)
        };
        self.deliver_to_all(MessageRecord::quest_change(name, value, old_value));
    }

    fn quest_exists(&self, name: &str) -> bool {
        self.state.borrow().quests.contains_key(name)
    }

    fn quest_delete(&self, name: &str) {
        self.state.borrow_mut().quests.remove(name);
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;
    use std::cell::Cell;

    use crate::services::EngineHandle;

    struct Recorder {
        name: String,
        hits: Rc<RefCell<Vec<String>>>,
        result: Cell<bool>,
    }

    impl ScriptReceiver for Recorder {
        fn class_name(&self) -> &str {
            &self.name
        }

        fn receive(&self, record: Rc<MessageRecord>, _reply: Option<Reply>) -> bool {
            self.hits.borrow_mut().push(record.name.clone());
            self.result.get()
        }
    }

    fn recorder(hits: &Rc<RefCell<Vec<String>>>) -> Rc<Recorder> {
        Rc::new(Recorder {
            name: "Recorder".to_string(),
            hits: hits.clone(),
            result: Cell::new(true),
        })
    }

    #[test]
    fn send_delivers_synchronously_and_aggregates_results() {
        let engine = MemoryEngine::new();
        let host = engine.create_object("Host", &[]);
        let hits = Rc::new(RefCell::new(Vec::new()));
        let ok = recorder(&hits);
        let failing = recorder(&hits);
        failing.result.set(false);
        engine.attach_script(host, ok);
        engine.attach_script(host, failing);

        let handle = EngineHandle::new(engine);
        let result = MessageRecord::generic("Ping").send(&handle, ObjectId::NONE, host);
        assert!(!result);
        assert_eq!(*hits.borrow(), vec!["Ping", "Ping"]);
    }

    #[test]
    fn post_is_deferred_until_pump() {
        let engine = MemoryEngine::new();
        let host = engine.create_object("Host", &[]);
        let hits = Rc::new(RefCell::new(Vec::new()));
        engine.attach_script(host, recorder(&hits));

        let handle = EngineHandle::new(engine.clone());
        MessageRecord::generic("Later").post(&handle, host, host);
        assert!(hits.borrow().is_empty());
        engine.pump();
        assert_eq!(*hits.borrow(), vec!["Later"]);
    }

    #[test]
    fn scheduled_deliveries_fire_in_due_order_and_repeat() {
        let engine = MemoryEngine::new();
        let host = engine.create_object("Host", &[]);
        let hits = Rc::new(RefCell::new(Vec::new()));
        engine.attach_script(host, recorder(&hits));

        let handle = EngineHandle::new(engine.clone());
        MessageRecord::timer("Slow").schedule(&handle, host, host, Time(200), false);
        MessageRecord::timer("Fast").schedule(&handle, host, host, Time(50), false);
        let mut repeating =
            MessageRecord::timer("Tick").schedule(&handle, host, host, Time(100), true);

        engine.advance(Time(200));
        assert_eq!(*hits.borrow(), vec!["Timer", "Timer", "Timer", "Timer"]);

        // Two more periods, then cancellation stops the repetition.
        engine.advance(Time(200));
        assert_eq!(hits.borrow().len(), 6);
        repeating.cancel(&handle);
        repeating.cancel(&handle);
        engine.advance(Time(500));
        assert_eq!(hits.borrow().len(), 6);
    }

    #[test]
    fn cancel_before_due_suppresses_delivery() {
        let engine = MemoryEngine::new();
        let host = engine.create_object("Host", &[]);
        let hits = Rc::new(RefCell::new(Vec::new()));
        engine.attach_script(host, recorder(&hits));

        let handle = EngineHandle::new(engine.clone());
        let mut timer = MessageRecord::timer("Never").schedule(&handle, host, host, Time(100), false);
        timer.cancel(&handle);
        engine.advance(Time(1000));
        assert!(hits.borrow().is_empty());
    }

    #[test]
    fn ancestors_walk_breadth_first_nearest_first() {
        let engine = MemoryEngine::new();
        let root = engine.create_object("Root", &[]);
        let meta = engine.create_object("Meta", &[root]);
        let parent = engine.create_object("Parent", &[root]);
        let child = engine.create_object("Child", &[parent, meta]);

        assert_eq!(engine.get_ancestors(child), vec![parent, meta, root]);
        assert_eq!(engine.get_ancestors(root), Vec::<ObjectId>::new());
    }

    #[test]
    fn quest_set_delivers_a_change_record_with_old_and_new() {
        let engine = MemoryEngine::new();
        let host = engine.create_object("Host", &[]);

        struct QuestProbe {
            name: String,
            seen: Rc<RefCell<Vec<(String, i32, i32)>>>,
        }
        impl ScriptReceiver for QuestProbe {
            fn class_name(&self) -> &str {
                &self.name
            }
            fn receive(&self, record: Rc<MessageRecord>, _reply: Option<Reply>) -> bool {
                if let crate::message::Payload::QuestChange {
                    quest_var,
                    new_value,
                    old_value,
                } = &record.payload
                {
                    self.seen
                        .borrow_mut()
                        .push((quest_var.clone(), *new_value, *old_value));
                }
                true
            }
        }

        let seen = Rc::new(RefCell::new(Vec::new()));
        engine.attach_script(
            host,
            Rc::new(QuestProbe {
                name: "QuestProbe".to_string(),
                seen: seen.clone(),
            }),
        );

        engine.quest_set("goal_state_1", 1);
        engine.quest_set("goal_state_1", 2);
        assert_eq!(
            *seen.borrow(),
            vec![
                ("goal_state_1".to_string(), 1, 0),
                ("goal_state_1".to_string(), 2, 1)
            ]
        );
    }

    #[test]
    fn links_filter_by_flavor_and_endpoints() {
        let engine = MemoryEngine::new();
        let a = engine.create_object("A", &[]);
        let b = engine.create_object("B", &[]);
        let c = engine.create_object("C", &[]);
        engine.add_link("ControlDevice", a, b, Value::Empty);
        engine.add_link("ControlDevice", a, c, Value::Empty);
        let switched = engine.add_link("SwitchLink", a, b, Value::Empty);

        assert_eq!(
            engine
                .get_links(Some("ControlDevice"), a, ObjectId::NONE)
                .len(),
            2
        );
        assert_eq!(engine.get_links(None, a, b).len(), 2);
        engine.destroy_link(switched);
        assert_eq!(engine.get_links(None, a, b).len(), 1);
    }
}
