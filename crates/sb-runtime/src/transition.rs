use std::rc::{Rc, Weak};

use sb_core::{Curve, ScriptBindError, Time, Vector};

use crate::message::{DataSlot, Message, MessageRecord, Timer};
use crate::params::Parameter;
use crate::persist::Persistent;
use crate::script::{Flow, HandlerId, Script};

struct TransitionInner {
    name: String,
    resolution: Time,
    length: Parameter<Time>,
    curve: Parameter<Curve>,
    timer: Persistent<Timer>,
    remaining: Persistent<Time>,
    step: Box<dyn Fn(&Script) -> bool>,
}

/// Timed interpolation cycle layered on persistent variables and script
/// timers. Registers itself as a `TransitionStep` timer handler on its host
/// script and unregisters on drop.
pub struct Transition {
    inner: Rc<TransitionInner>,
    script: Weak<Script>,
    handler: HandlerId,
}

impl Transition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        script: &Rc<Script>,
        step: impl Fn(&Script) -> bool + 'static,
        name: impl Into<String>,
        resolution: Time,
        default_length: Time,
        default_curve: Curve,
        length_param: &str,
        curve_param: &str,
    ) -> Self {
        let name = name.into();
        let inner = Rc::new(TransitionInner {
            length: script.parameter(length_param, Some(default_length)),
            curve: script.parameter(curve_param, Some(default_curve)),
            timer: script.persistent(&format!("transition_timer_{}", name)),
            remaining: script.persistent(&format!("transition_remaining_{}", name)),
            resolution,
            name,
            step: Box::new(step),
        });

        let weak = Rc::downgrade(&inner);
        let handler = script.listen_timer("TransitionStep", move |script, message| {
            match weak.upgrade() {
                Some(inner) => inner.handle(script, message),
                None => Ok(Flow::Continue),
            }
        });

        Self {
            inner,
            script: Rc::downgrade(script),
            handler,
        }
    }

    fn script(&self) -> Result<Rc<Script>, ScriptBindError> {
        self.script.upgrade().ok_or_else(|| {
            ScriptBindError::new(
                "RESOURCE_MISSING",
                "The owning script instance is no longer alive.",
            )
        })
    }

    /// Begins a new cycle, stopping any previous one first. The first step
    /// runs synchronously via a self-sent timer message.
    pub fn start(&self) -> Result<(), ScriptBindError> {
        let script = self.script()?;
        self.abort()?;
        self.inner.remaining.set(self.inner.length.get()?)?;
        MessageRecord::timer("TransitionStep")
            .with_data1(self.inner.name.clone())
            .send(script.engine(), script.host(), script.host());
        Ok(())
    }

    pub fn abort(&self) -> Result<(), ScriptBindError> {
        let script = self.script()?;
        if self.inner.timer.exists() {
            let mut timer = self.inner.timer.get()?;
            timer.cancel(script.engine());
            self.inner.timer.remove()?;
        }
        if self.inner.remaining.exists() {
            self.inner.remaining.remove()?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> Result<bool, ScriptBindError> {
        Ok(!self.inner.remaining.exists() || self.inner.remaining.get()? == Time::ZERO)
    }

    pub fn progress(&self) -> Result<f32, ScriptBindError> {
        if !self.inner.remaining.exists() {
            return Ok(0.0);
        }
        let length = self.inner.length.get()?;
        let remaining = self.inner.remaining.get()?;
        if length == Time::ZERO || remaining == Time::ZERO {
            Ok(1.0)
        } else {
            Ok((length.millis() - remaining.millis()) as f32 / length.millis() as f32)
        }
    }

    fn alpha(&self) -> Result<f64, ScriptBindError> {
        Ok(self.inner.curve.get()?.apply(f64::from(self.progress()?)))
    }

    pub fn interpolate_f32(&self, from: f32, to: f32) -> Result<f32, ScriptBindError> {
        let alpha = self.alpha()? as f32;
        Ok(from + (to - from) * alpha)
    }

    pub fn interpolate_vector(&self, from: Vector, to: Vector) -> Result<Vector, ScriptBindError> {
        let alpha = self.alpha()? as f32;
        Ok(Vector::new(
            from.x + (to.x - from.x) * alpha,
            from.y + (to.y - from.y) * alpha,
            from.z + (to.z - from.z) * alpha,
        ))
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        if let Some(script) = self.script.upgrade() {
            script.forget_timer(self.handler);
        }
    }
}

impl TransitionInner {
    fn handle(&self, script: &Script, message: &Message) -> Result<Flow, ScriptBindError> {
        // Several transitions may share the TransitionStep timer name; the
        // payload distinguishes them.
        if message.data_or(DataSlot::Data1, String::new())? != self.name {
            return Ok(Flow::Continue);
        }

        let proceed = (self.step)(script);
        let remaining = if self.remaining.exists() {
            self.remaining.get()?
        } else {
            Time::ZERO
        };

        if proceed && remaining > Time::ZERO {
            self.remaining
                .set(remaining.saturating_sub(self.resolution))?;
            self.timer.set(script.start_timer_with_data(
                "TransitionStep",
                self.resolution,
                false,
                self.name.clone(),
            ))?;
        } else {
            self.timer.remove()?;
            self.remaining.remove()?;
        }

        Ok(Flow::Halt)
    }
}
