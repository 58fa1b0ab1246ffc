use std::rc::Rc;

use sb_core::{ObjectId, ScriptBindError, Time};

use crate::message::{DataSlot, Message, MessageRecord, Timer};
use crate::persist::Persistent;
use crate::script::{Flow, LogLevel, Script};
use crate::services::EngineHandle;

/// How a nonzero `ScriptTiming` property shapes trap activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrapTiming {
    /// Activate immediately; timing is ignored.
    #[default]
    None,
    /// Delay the activation by the timing interval.
    Delay,
    /// Activate immediately, then revert after the timing interval.
    Revert,
}

#[derive(Debug, Clone)]
pub struct TrapTriggerOptions {
    pub script_name: String,
    pub host: ObjectId,
    pub min_level: LogLevel,
    pub timing: TrapTiming,
}

type OnTrap = dyn Fn(&Script, bool, &Message) -> Result<Flow, ScriptBindError>;

/// Standard trap/trigger script: TurnOn/TurnOff handling gated by the host's
/// trap control flags, with optional delayed or reverting activation.
/// `on_trap` receives the effective on/off state after filtering and
/// inversion.
pub fn build_trap_trigger(
    engine: &EngineHandle,
    options: TrapTriggerOptions,
    on_trap: impl Fn(&Script, bool, &Message) -> Result<Flow, ScriptBindError> + 'static,
) -> Rc<Script> {
    let script = Script::new(options.script_name, options.host, engine, options.min_level);
    let timer: Rc<Persistent<Timer>> = Rc::new(script.persistent("trap_timer"));
    let on_trap: Rc<OnTrap> = Rc::new(on_trap);
    let timing = options.timing;

    for on in [true, false] {
        let name = if on { "TurnOn" } else { "TurnOff" };
        let handler = turn_handler(on, timing, timer.clone(), on_trap.clone());
        script.listen_message(name, handler);
        let handler = turn_handler(on, timing, timer.clone(), on_trap.clone());
        script.listen_timer(name, handler);
    }

    if timing != TrapTiming::None {
        let on_trap = on_trap.clone();
        script.listen_timer("TrapTiming", move |script, message| {
            let on = message.data_or(DataSlot::Data1, false)?;
            let result = on_trap(script, on, message)?;
            lock_if_single_use(script, result)?;
            Ok(result)
        });
    }

    script
}

fn turn_handler(
    on: bool,
    timing: TrapTiming,
    timer: Rc<Persistent<Timer>>,
    on_trap: Rc<OnTrap>,
) -> impl Fn(&Script, &Message) -> Result<Flow, ScriptBindError> {
    move |script, message| {
        let host = script.script_host();
        let filter = if on {
            host.trap_on().get()?
        } else {
            host.trap_off().get()?
        };
        if !filter {
            return Ok(Flow::Halt);
        }
        if host.is_locked()? {
            return Ok(Flow::Halt);
        }

        if timer.exists() {
            let mut pending = timer.get()?;
            pending.cancel(script.engine());
            timer.remove()?;
        }

        let actual = if host.trap_invert().get()? { !on } else { on };
        let delay = host.script_timing().get()?;

        if delay != Time::ZERO && timing == TrapTiming::Delay {
            timer.set(script.start_timer_with_data("TrapTiming", delay, false, actual))?;
            return Ok(Flow::Continue);
        }

        let result = on_trap(script, actual, message)?;

        if on && result == Flow::Continue && delay != Time::ZERO && timing == TrapTiming::Revert {
            timer.set(script.start_timer_with_data("TrapTiming", delay, false, !actual))?;
        }

        lock_if_single_use(script, result)?;
        Ok(result)
    }
}

fn lock_if_single_use(script: &Script, result: Flow) -> Result<(), ScriptBindError> {
    let host = script.script_host();
    if result != Flow::Error && host.trap_once().get()? {
        host.set_locked(true)?;
    }
    Ok(())
}

/// Fires a trigger: broadcasts TurnOn/TurnOff along the host's ControlDevice
/// links, honoring the trap control flags when `filtered` and the lock when
/// `conditional`.
pub fn trigger(
    script: &Script,
    on: bool,
    conditional: bool,
    filtered: bool,
) -> Result<(), ScriptBindError> {
    let host = script.script_host();
    if conditional && host.is_locked()? {
        return Ok(());
    }
    if filtered && on && !host.trap_on().get()? {
        return Ok(());
    }
    if filtered && !on && !host.trap_off().get()? {
        return Ok(());
    }

    let actual = if host.trap_invert().get()? { !on } else { on };
    MessageRecord::generic(if actual { "TurnOn" } else { "TurnOff" }).broadcast(
        script.engine(),
        script.host(),
        "ControlDevice",
        Time::ZERO,
    );

    if conditional && host.trap_once().get()? {
        host.set_locked(true)?;
    }
    Ok(())
}

#[cfg(test)]
mod trap_tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    use sb_core::Value;

    use crate::memory::MemoryEngine;
    use crate::property::{SCRIPT_TIMING, TRAP_INVERT, TRAP_ON, TRAP_ONCE};
    use crate::services::PropertyStore;

    struct Fixture {
        engine: Rc<MemoryEngine>,
        handle: EngineHandle,
        host: ObjectId,
        script: Rc<Script>,
        fired: Rc<RefCell<Vec<bool>>>,
    }

    fn fixture(timing: TrapTiming) -> Fixture {
        let engine = MemoryEngine::new();
        let host = engine.create_object("TrapHost", &[]);
        let handle = EngineHandle::new(engine.clone());
        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired_in = fired.clone();
        let script = build_trap_trigger(
            &handle,
            TrapTriggerOptions {
                script_name: "StdTrap".to_string(),
                host,
                min_level: LogLevel::Error,
                timing,
            },
            move |_, on, _| {
                fired_in.borrow_mut().push(on);
                Ok(Flow::Continue)
            },
        );
        engine.attach_script(host, script.clone());
        Fixture {
            engine,
            handle,
            host,
            script,
            fired,
        }
    }

    fn send(fixture: &Fixture, name: &str) -> bool {
        MessageRecord::generic(name).send(&fixture.handle, ObjectId::NONE, fixture.host)
    }

    #[test]
    fn turn_on_and_off_reach_the_trap_body() {
        let fixture = fixture(TrapTiming::None);
        assert!(send(&fixture, "TurnOn"));
        assert!(send(&fixture, "TurnOff"));
        assert_eq!(*fixture.fired.borrow(), vec![true, false]);
    }

    #[test]
    fn invert_flag_flips_the_effective_state() {
        let fixture = fixture(TrapTiming::None);
        fixture
            .handle
            .properties
            .set_property(fixture.host, &TRAP_INVERT.key(), Value::Int(2))
            .expect("seed invert");
        send(&fixture, "TurnOn");
        assert_eq!(*fixture.fired.borrow(), vec![false]);
    }

    #[test]
    fn trap_on_filter_halts_without_firing() {
        let fixture = fixture(TrapTiming::None);
        // TrapFlags bit 4 is "no TurnOn" (negated sense).
        fixture
            .handle
            .properties
            .set_property(fixture.host, &TRAP_ON.key(), Value::Int(4))
            .expect("seed flags");
        send(&fixture, "TurnOn");
        assert!(fixture.fired.borrow().is_empty());
        send(&fixture, "TurnOff");
        assert_eq!(*fixture.fired.borrow(), vec![false]);
    }

    #[test]
    fn single_use_trap_locks_after_the_first_activation() {
        let fixture = fixture(TrapTiming::None);
        fixture
            .handle
            .properties
            .set_property(fixture.host, &TRAP_ONCE.key(), Value::Int(1))
            .expect("seed flags");
        send(&fixture, "TurnOn");
        send(&fixture, "TurnOn");
        assert_eq!(*fixture.fired.borrow(), vec![true]);
        assert!(fixture.script.script_host().is_locked().expect("locked"));
    }

    #[test]
    fn delay_timing_defers_activation_through_a_timer() {
        let fixture = fixture(TrapTiming::Delay);
        fixture
            .handle
            .properties
            .set_property(fixture.host, &SCRIPT_TIMING.key(), Value::Int(150))
            .expect("seed timing");

        send(&fixture, "TurnOn");
        assert!(fixture.fired.borrow().is_empty());
        fixture.engine.advance(Time(150));
        assert_eq!(*fixture.fired.borrow(), vec![true]);
    }

    #[test]
    fn revert_timing_fires_now_and_schedules_the_opposite() {
        let fixture = fixture(TrapTiming::Revert);
        fixture
            .handle
            .properties
            .set_property(fixture.host, &SCRIPT_TIMING.key(), Value::Int(200))
            .expect("seed timing");

        send(&fixture, "TurnOn");
        assert_eq!(*fixture.fired.borrow(), vec![true]);
        fixture.engine.advance(Time(200));
        assert_eq!(*fixture.fired.borrow(), vec![true, false]);
    }

    #[test]
    fn retriggering_cancels_the_pending_timer() {
        let fixture = fixture(TrapTiming::Delay);
        fixture
            .handle
            .properties
            .set_property(fixture.host, &SCRIPT_TIMING.key(), Value::Int(100))
            .expect("seed timing");

        send(&fixture, "TurnOn");
        send(&fixture, "TurnOff");
        fixture.engine.advance(Time(500));
        // Only the rescheduled TurnOff activation survives.
        assert_eq!(*fixture.fired.borrow(), vec![false]);
    }

    #[test]
    fn trigger_broadcasts_along_control_device_links() {
        let engine = MemoryEngine::new();
        let source = engine.create_object("Button", &[]);
        let dest = engine.create_object("Door", &[]);
        engine.add_link("ControlDevice", source, dest, Value::Empty);
        let handle = EngineHandle::new(engine.clone());

        let button = Script::new("Button", source, &handle, LogLevel::Error);
        engine.attach_script(source, button.clone());

        let received = Rc::new(Cell::new(0));
        let door = Script::new("Door", dest, &handle, LogLevel::Error);
        {
            let received = received.clone();
            door.listen_message("TurnOn", move |_, _| {
                received.set(received.get() + 1);
                Ok(Flow::Continue)
            });
        }
        engine.attach_script(dest, door.clone());

        trigger(&button, true, false, false).expect("trigger");
        assert_eq!(received.get(), 1);
    }
}
