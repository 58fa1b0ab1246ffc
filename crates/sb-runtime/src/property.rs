use std::rc::Rc;

use sb_core::{Component, ObjectId, ScriptBindError, Time, Value, Vector};

use crate::services::{PropertyKey, PropertyStore};

/// Get/set transform applied between a stored property value and one typed
/// field of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    /// The field is the whole stored value.
    Plain,
    /// Boolean field backed by one bit of a stored integer; a negative mask
    /// encodes an inverted sense.
    Bitmask(i32),
    /// Float field backed by one labeled axis of a stored 3-vector.
    Component(Component),
}

/// Static configuration of one typed property field.
#[derive(Debug, Clone)]
pub struct FieldSpec<T: 'static> {
    pub major: &'static str,
    pub minor: Option<&'static str>,
    pub access: FieldAccess,
    pub default: T,
}

impl<T> FieldSpec<T> {
    pub fn key(&self) -> PropertyKey {
        match self.minor {
            Some(minor) => PropertyKey::with_minor(self.major, minor),
            None => PropertyKey::new(self.major),
        }
    }
}

/// Fixed-size indexed family of fields sharing one transform pair (per-slot
/// or per-joint properties). Slot access out of range is a caller contract
/// violation and fails fast.
#[derive(Debug, Clone)]
pub struct FieldFamily<T: 'static> {
    pub items: &'static [FieldSpec<T>],
}

impl<T> FieldFamily<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn at(&self, slot: usize) -> &'static FieldSpec<T> {
        &self.items[slot]
    }
}

/// Typed decoding/encoding of a field through its access transform.
pub trait FieldValue: Sized + Clone {
    fn read(
        access: FieldAccess,
        default: &Self,
        stored: Option<&Value>,
    ) -> Result<Self, ScriptBindError>;

    fn write(
        access: FieldAccess,
        stored: Option<&Value>,
        value: &Self,
    ) -> Result<Value, ScriptBindError>;
}

fn unsupported(access: FieldAccess, ty: &str) -> ScriptBindError {
    ScriptBindError::new(
        "VALUE_TYPE_MISMATCH",
        format!("Field access {:?} is not supported for {}.", access, ty),
    )
}

fn stored_or_empty(stored: Option<&Value>) -> &Value {
    stored.unwrap_or(&Value::Empty)
}

impl FieldValue for bool {
    fn read(
        access: FieldAccess,
        default: &Self,
        stored: Option<&Value>,
    ) -> Result<Self, ScriptBindError> {
        let stored = stored_or_empty(stored);
        match access {
            FieldAccess::Plain => {
                if stored.is_empty() {
                    Ok(*default)
                } else {
                    stored.as_bool()
                }
            }
            FieldAccess::Bitmask(detail) => {
                if stored.is_empty() {
                    return Ok(*default);
                }
                let negate = detail < 0;
                let mask = detail.unsigned_abs();
                let raw_bit = stored.as_uint()? & mask != 0;
                Ok(if negate { !raw_bit } else { raw_bit })
            }
            FieldAccess::Component(_) => Err(unsupported(access, "bool")),
        }
    }

    fn write(
        access: FieldAccess,
        stored: Option<&Value>,
        value: &Self,
    ) -> Result<Value, ScriptBindError> {
        let stored = stored_or_empty(stored);
        match access {
            FieldAccess::Plain => Ok(Value::from(*value)),
            FieldAccess::Bitmask(detail) => {
                let negate = detail < 0;
                let mask = detail.unsigned_abs();
                let raw_field = if stored.is_empty() {
                    0
                } else {
                    stored.as_uint()?
                };
                let raw_bit = if negate { !*value } else { *value };
                // Merge into the stored integer so unrelated bits survive.
                let merged = if raw_bit {
                    raw_field | mask
                } else {
                    raw_field & !mask
                };
                Ok(Value::from(merged))
            }
            FieldAccess::Component(_) => Err(unsupported(access, "bool")),
        }
    }
}

impl FieldValue for f32 {
    fn read(
        access: FieldAccess,
        default: &Self,
        stored: Option<&Value>,
    ) -> Result<Self, ScriptBindError> {
        let stored = stored_or_empty(stored);
        match access {
            FieldAccess::Plain => {
                if stored.is_empty() {
                    Ok(*default)
                } else {
                    stored.as_float()
                }
            }
            FieldAccess::Component(component) => {
                if stored.is_empty() {
                    Ok(*default)
                } else {
                    Ok(stored.as_vector()?.component(component))
                }
            }
            FieldAccess::Bitmask(_) => Err(unsupported(access, "f32")),
        }
    }

    fn write(
        access: FieldAccess,
        stored: Option<&Value>,
        value: &Self,
    ) -> Result<Value, ScriptBindError> {
        let stored = stored_or_empty(stored);
        match access {
            FieldAccess::Plain => Ok(Value::from(*value)),
            FieldAccess::Component(component) => {
                let mut vector = if stored.is_empty() {
                    Vector::default()
                } else {
                    stored.as_vector()?
                };
                vector.set_component(component, *value);
                Ok(Value::from(vector))
            }
            FieldAccess::Bitmask(_) => Err(unsupported(access, "f32")),
        }
    }
}

macro_rules! plain_field_value {
    ($ty:ty, $name:literal, $as:ident) => {
        impl FieldValue for $ty {
            fn read(
                access: FieldAccess,
                default: &Self,
                stored: Option<&Value>,
            ) -> Result<Self, ScriptBindError> {
                let stored = stored_or_empty(stored);
                match access {
                    FieldAccess::Plain => {
                        if stored.is_empty() {
                            Ok(default.clone())
                        } else {
                            stored.$as()
                        }
                    }
                    _ => Err(unsupported(access, $name)),
                }
            }

            fn write(
                access: FieldAccess,
                _stored: Option<&Value>,
                value: &Self,
            ) -> Result<Value, ScriptBindError> {
                match access {
                    FieldAccess::Plain => Ok(Value::from(value.clone())),
                    _ => Err(unsupported(access, $name)),
                }
            }
        }
    };
}

plain_field_value!(i32, "i32", as_int);
plain_field_value!(u32, "u32", as_uint);
plain_field_value!(String, "String", as_string);
plain_field_value!(Vector, "Vector", as_vector);
plain_field_value!(Time, "Time", as_time);

/// Typed accessor for one property field of one object. Purely a view: no
/// ownership of the underlying store.
pub struct PropField<T: FieldValue + 'static> {
    properties: Rc<dyn PropertyStore>,
    object: ObjectId,
    spec: &'static FieldSpec<T>,
}

impl<T: FieldValue> PropField<T> {
    pub fn new(
        properties: Rc<dyn PropertyStore>,
        object: ObjectId,
        spec: &'static FieldSpec<T>,
    ) -> Self {
        Self {
            properties,
            object,
            spec,
        }
    }

    pub fn get(&self) -> Result<T, ScriptBindError> {
        self.get_with(true)
    }

    /// Resolves the field, optionally consulting the object's inheritance
    /// ancestry; a missing property reads as the configured default.
    pub fn get_with(&self, inherit: bool) -> Result<T, ScriptBindError> {
        let stored = self
            .properties
            .get_property(self.object, &self.spec.key(), inherit);
        T::read(self.spec.access, &self.spec.default, stored.as_ref())
    }

    /// Writes always land on the object itself; bit and component transforms
    /// merge into the resolved value so unrelated parts survive.
    pub fn set(&self, value: T) -> Result<(), ScriptBindError> {
        let key = self.spec.key();
        let stored = self.properties.get_property(self.object, &key, true);
        let merged = T::write(self.spec.access, stored.as_ref(), &value)?;
        self.properties.set_property(self.object, &key, merged)
    }

    pub fn exists(&self) -> bool {
        self.properties
            .property_exists(self.object, &self.spec.key(), true)
    }

    pub fn remove(&self) -> Result<(), ScriptBindError> {
        self.properties.remove_property(self.object, &self.spec.key())
    }
}

pub const SCRIPT_TIMING: FieldSpec<Time> = FieldSpec {
    major: "ScriptTiming",
    minor: None,
    access: FieldAccess::Plain,
    default: Time::ZERO,
};

pub const TRAP_ON: FieldSpec<bool> = FieldSpec {
    major: "TrapFlags",
    minor: None,
    access: FieldAccess::Bitmask(-4),
    default: true,
};

pub const TRAP_OFF: FieldSpec<bool> = FieldSpec {
    major: "TrapFlags",
    minor: None,
    access: FieldAccess::Bitmask(-8),
    default: true,
};

pub const TRAP_INVERT: FieldSpec<bool> = FieldSpec {
    major: "TrapFlags",
    minor: None,
    access: FieldAccess::Bitmask(2),
    default: false,
};

pub const TRAP_ONCE: FieldSpec<bool> = FieldSpec {
    major: "TrapFlags",
    minor: None,
    access: FieldAccess::Bitmask(1),
    default: false,
};

pub const LOCKED: FieldSpec<bool> = FieldSpec {
    major: "Locked",
    minor: None,
    access: FieldAccess::Plain,
    default: false,
};

/// Wrapper over any object hosting a script: its timing and trap control
/// fields.
pub struct ScriptHost {
    properties: Rc<dyn PropertyStore>,
    object: ObjectId,
}

impl ScriptHost {
    pub fn new(properties: Rc<dyn PropertyStore>, object: ObjectId) -> Self {
        Self { properties, object }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    fn field<T: FieldValue>(&self, spec: &'static FieldSpec<T>) -> PropField<T> {
        PropField::new(self.properties.clone(), self.object, spec)
    }

    pub fn script_timing(&self) -> PropField<Time> {
        self.field(&SCRIPT_TIMING)
    }

    pub fn trap_on(&self) -> PropField<bool> {
        self.field(&TRAP_ON)
    }

    pub fn trap_off(&self) -> PropField<bool> {
        self.field(&TRAP_OFF)
    }

    pub fn trap_invert(&self) -> PropField<bool> {
        self.field(&TRAP_INVERT)
    }

    pub fn trap_once(&self) -> PropField<bool> {
        self.field(&TRAP_ONCE)
    }

    pub fn locked(&self) -> PropField<bool> {
        self.field(&LOCKED)
    }

    pub fn is_locked(&self) -> Result<bool, ScriptBindError> {
        self.locked().get()
    }

    pub fn set_locked(&self, locked: bool) -> Result<(), ScriptBindError> {
        self.locked().set(locked)
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use crate::services::EngineHandle;

    const HIT_POINTS: FieldSpec<i32> = FieldSpec {
        major: "HitPoints",
        minor: None,
        access: FieldAccess::Plain,
        default: 10,
    };

    const VELOCITY_Z: FieldSpec<f32> = FieldSpec {
        major: "PhysState",
        minor: Some("Velocity"),
        access: FieldAccess::Component(Component::Z),
        default: 0.5,
    };

    const JOINT_RATES: FieldFamily<f32> = FieldFamily {
        items: &[
            FieldSpec {
                major: "CfgTweqJoints",
                minor: Some("rate-low-high"),
                access: FieldAccess::Component(Component::X),
                default: 0.0,
            },
            FieldSpec {
                major: "CfgTweqJoints",
                minor: Some("rate-low-high2"),
                access: FieldAccess::Component(Component::X),
                default: 0.0,
            },
        ],
    };

    fn fixture() -> (EngineHandle, ObjectId) {
        let engine = MemoryEngine::new();
        let object = engine.create_object("Widget", &[]);
        (EngineHandle::new(engine), object)
    }

    #[test]
    fn plain_field_returns_default_when_the_property_is_missing() {
        let (handle, object) = fixture();
        let field = PropField::new(handle.properties.clone(), object, &HIT_POINTS);
        assert!(!field.exists());
        assert_eq!(field.get().expect("default"), 10);

        field.set(25).expect("set");
        assert!(field.exists());
        assert_eq!(field.get().expect("stored"), 25);

        field.remove().expect("remove");
        assert_eq!(field.get().expect("default again"), 10);
    }

    #[test]
    fn bitmask_write_merges_into_unrelated_bits() {
        let (handle, object) = fixture();
        handle
            .properties
            .set_property(object, &TRAP_INVERT.key(), Value::Int(0x10))
            .expect("seed");

        let invert = PropField::new(handle.properties.clone(), object, &TRAP_INVERT);
        invert.set(true).expect("set bit");
        assert_eq!(
            handle
                .properties
                .get_property(object, &TRAP_INVERT.key(), false)
                .expect("stored"),
            Value::Int(0x12)
        );
        assert!(invert.get().expect("read bit"));

        invert.set(false).expect("clear bit");
        assert_eq!(
            handle
                .properties
                .get_property(object, &TRAP_INVERT.key(), false)
                .expect("stored"),
            Value::Int(0x10)
        );
    }

    #[test]
    fn negated_bitmask_inverts_both_read_and_write() {
        let (handle, object) = fixture();
        let on = PropField::new(handle.properties.clone(), object, &TRAP_ON);

        // Missing property reads as the default.
        assert!(on.get().expect("default"));

        // Writing the logical value stores the inverted bit.
        on.set(false).expect("set");
        assert_eq!(
            handle
                .properties
                .get_property(object, &TRAP_ON.key(), false)
                .expect("stored"),
            Value::Int(4)
        );
        assert!(!on.get().expect("read"));

        on.set(true).expect("set back");
        assert_eq!(
            handle
                .properties
                .get_property(object, &TRAP_ON.key(), false)
                .expect("stored"),
            Value::Int(0)
        );
    }

    #[test]
    fn component_field_reads_one_axis_and_defaults_when_empty() {
        let (handle, object) = fixture();
        let field = PropField::new(handle.properties.clone(), object, &VELOCITY_Z);
        assert_eq!(field.get().expect("default"), 0.5);

        handle
            .properties
            .set_property(
                object,
                &VELOCITY_Z.key(),
                Value::from(Vector::new(1.0, 2.0, 3.0)),
            )
            .expect("seed");
        assert_eq!(field.get().expect("axis"), 3.0);

        field.set(9.0).expect("write axis");
        assert_eq!(
            handle
                .properties
                .get_property(object, &VELOCITY_Z.key(), false)
                .expect("stored"),
            Value::from(Vector::new(1.0, 2.0, 9.0))
        );
    }

    #[test]
    fn field_families_index_by_slot() {
        let (handle, object) = fixture();
        let first = PropField::new(handle.properties.clone(), object, JOINT_RATES.at(0));
        let second = PropField::new(handle.properties.clone(), object, JOINT_RATES.at(1));
        first.set(1.5).expect("first");
        second.set(2.5).expect("second");
        assert_eq!(first.get().expect("first"), 1.5);
        assert_eq!(second.get().expect("second"), 2.5);
        assert_eq!(JOINT_RATES.len(), 2);
    }

    #[test]
    #[should_panic]
    fn out_of_range_slot_fails_fast() {
        let _ = JOINT_RATES.at(5);
    }

    #[test]
    fn fields_resolve_through_the_inheritance_ancestry() {
        let engine = MemoryEngine::new();
        let archetype = engine.create_object("LeverArchetype", &[]);
        let lever = engine.create_object("Lever", &[archetype]);
        let handle = EngineHandle::new(engine);
        handle
            .properties
            .set_property(archetype, &HIT_POINTS.key(), Value::Int(40))
            .expect("seed archetype");

        let field = PropField::new(handle.properties.clone(), lever, &HIT_POINTS);
        assert_eq!(field.get().expect("inherited"), 40);
        assert_eq!(field.get_with(false).expect("local default"), 10);

        // A local write shadows the archetype value.
        field.set(55).expect("set");
        assert_eq!(field.get_with(false).expect("local"), 55);
        assert_eq!(
            PropField::new(handle.properties.clone(), archetype, &HIT_POINTS)
                .get()
                .expect("archetype untouched"),
            40
        );
    }

    #[test]
    fn wrong_kind_under_a_bitmask_surfaces_a_type_error() {
        let (handle, object) = fixture();
        handle
            .properties
            .set_property(object, &TRAP_ONCE.key(), Value::from("garbage"))
            .expect("seed");
        let field = PropField::new(handle.properties.clone(), object, &TRAP_ONCE);
        let error = field.get().expect_err("string under bitmask should fail");
        assert_eq!(error.code, "VALUE_TYPE_MISMATCH");
    }
}
