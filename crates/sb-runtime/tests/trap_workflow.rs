use std::cell::Cell;
use std::rc::Rc;

use sb_core::{Curve, ObjectId, Time, Value};
use sb_runtime::{
    build_trap_trigger, trigger, EngineHandle, Flow, LogLevel, MemoryEngine, MessageRecord,
    PropertyKey, PropertyStore, QuestStore, Script, Transition, TrapTiming, TrapTriggerOptions,
};

/// A button trap broadcasting along ControlDevice drives a door script whose
/// fade length comes from an inherited parameter.
#[test]
fn button_trap_drives_an_inherited_door_fade() {
    let engine = MemoryEngine::new();
    let door_archetype = engine.create_object("DoorArchetype", &[]);
    let button = engine.create_object("Button", &[]);
    let door = engine.create_object("Door", &[door_archetype]);
    engine.add_link("ControlDevice", button, door, Value::Empty);
    let handle = EngineHandle::new(engine.clone());

    // The fade length lives on the archetype, not the door itself.
    handle
        .properties
        .set_property(
            door_archetype,
            &PropertyKey::new("DesignNote"),
            Value::from("fade_time=300"),
        )
        .expect("set design note");

    let button_script = build_trap_trigger(
        &handle,
        TrapTriggerOptions {
            script_name: "ButtonRelay".to_string(),
            host: button,
            min_level: LogLevel::Error,
            timing: TrapTiming::None,
        },
        |script, on, _| {
            trigger(script, on, false, false)?;
            Ok(Flow::Continue)
        },
    );
    engine.attach_script(button, button_script);

    let door_script = Script::new("DoorFade", door, &handle, LogLevel::Error);
    let steps = Rc::new(Cell::new(0u32));
    let fade = {
        let steps = steps.clone();
        Rc::new(Transition::new(
            &door_script,
            move |_| {
                steps.set(steps.get() + 1);
                true
            },
            "open",
            Time(100),
            Time(500),
            Curve::Linear,
            "fade_time",
            "fade_curve",
        ))
    };
    {
        let fade = fade.clone();
        door_script.listen_message("TurnOn", move |_, _| {
            fade.start()?;
            Ok(Flow::Continue)
        });
    }
    engine.attach_script(door, door_script.clone());

    // Frobbing the button fans out through the link and starts the fade.
    assert!(MessageRecord::generic("TurnOn").send(&handle, ObjectId::NONE, button));
    assert_eq!(steps.get(), 1);
    assert!(!fade.is_finished().expect("running"));

    // 300ms at 100ms resolution: three timed steps, then the cleanup tick.
    engine.advance(Time(400));
    assert_eq!(steps.get(), 4);
    assert!(fade.is_finished().expect("finished"));
}

#[test]
fn sim_lifecycle_and_quest_changes_flow_through_attached_scripts() {
    let engine = MemoryEngine::new();
    let host = engine.create_object("MissionWatch", &[]);
    let handle = EngineHandle::new(engine.clone());

    let script = Script::new("MissionWatch", host, &handle, LogLevel::Error);
    let post_sims = Rc::new(Cell::new(0u32));
    {
        let post_sims = post_sims.clone();
        script.listen_message("PostSim", move |_, _| {
            post_sims.set(post_sims.get() + 1);
            Ok(Flow::Continue)
        });
    }
    let objectives = Rc::new(Cell::new(0u32));
    {
        let objectives = objectives.clone();
        script.listen_message("ObjectiveChange", move |_, message| {
            let change = message.objective_change()?;
            assert_eq!(change.objective, 2);
            objectives.set(objectives.get() + 1);
            Ok(Flow::Continue)
        });
    }
    engine.attach_script(host, script.clone());

    engine.begin_sim();
    engine.pump();
    assert!(script.is_sim());
    assert_eq!(post_sims.get(), 1);

    // Objective-related quest variables trigger the derived pass; plain
    // variables do not.
    handle.quests.quest_set("goal_state_2", 1);
    handle.quests.quest_set("loot_total", 450);
    assert_eq!(objectives.get(), 1);
}
