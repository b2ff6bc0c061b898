//! Small slaves used by the coordinator tests.

use std::{collections::HashMap, thread, time::Duration};

use crate::{
    traits::{Slave, SlaveError},
    transport::{LocalTransport, SlaveHandle},
    SlaveDescription, StateId, ValueRef,
};

pub const INPUT: ValueRef = 0;
pub const OUTPUT: ValueRef = 1;

/// `y = gain * u + offset`, with direct feedthrough and no state.
pub struct Affine {
    name: String,
    gain: f64,
    offset: f64,
    u: f64,
}

impl Affine {
    pub fn new(name: &str, gain: f64, offset: f64) -> Self {
        Self {
            name: name.to_owned(),
            gain,
            offset,
            u: 0.0,
        }
    }

    pub fn spawn(name: &str, gain: f64, offset: f64) -> SlaveHandle {
        LocalTransport::spawn(Self::new(name, gain, offset))
    }
}

impl Slave for Affine {
    fn description(&self) -> SlaveDescription {
        SlaveDescription::new(self.name.clone())
            .with_input(INPUT, "u", 0.0)
            .with_output(OUTPUT, "y", self.offset)
    }

    fn initialize(&mut self, _start_time: f64, _tolerance: Option<f64>) -> Result<(), SlaveError> {
        Ok(())
    }

    fn num_continuous_states(&self) -> usize {
        0
    }

    fn num_event_indicators(&self) -> usize {
        0
    }

    fn set_real(&mut self, vrs: &[ValueRef], values: &[f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values) {
            match *vr {
                INPUT => self.u = *value,
                other => return Err(SlaveError::UnknownVariable(other)),
            }
        }
        Ok(())
    }

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values.iter_mut()) {
            *value = match *vr {
                INPUT => self.u,
                OUTPUT => self.gain * self.u + self.offset,
                other => return Err(SlaveError::UnknownVariable(other)),
            };
        }
        Ok(())
    }

    fn do_step(&mut self, _time: f64, _step_size: f64) -> Result<(), SlaveError> {
        Ok(())
    }

    fn directional_derivative(
        &mut self,
        unknowns: &[ValueRef],
        knowns: &[ValueRef],
        seed: &[f64],
        values: &mut [f64],
    ) -> Result<(), SlaveError> {
        for (unknown, value) in unknowns.iter().zip(values.iter_mut()) {
            *value = knowns
                .iter()
                .zip(seed)
                .filter(|(known, _)| *unknown == OUTPUT && **known == INPUT)
                .map(|(_, s)| self.gain * s)
                .sum();
        }
        Ok(())
    }
}

/// `dx/dt = u`, output `x`. Supports state save/restore.
pub struct Integrator {
    name: String,
    x: f64,
    u: f64,
    saved: HashMap<StateId, (f64, f64)>,
    next_state: StateId,
}

impl Integrator {
    /// `u` is the value of the input until something connects to it.
    pub fn spawn(name: &str, u: f64) -> SlaveHandle {
        LocalTransport::spawn(Self {
            name: name.to_owned(),
            x: 0.0,
            u,
            saved: HashMap::new(),
            next_state: 0,
        })
    }
}

impl Slave for Integrator {
    fn description(&self) -> SlaveDescription {
        SlaveDescription::new(self.name.clone())
            .with_states(1, 0)
            .with_input(INPUT, "u", self.u)
            .with_output(OUTPUT, "x", 0.0)
    }

    fn initialize(&mut self, _start_time: f64, _tolerance: Option<f64>) -> Result<(), SlaveError> {
        Ok(())
    }

    fn num_continuous_states(&self) -> usize {
        1
    }

    fn num_event_indicators(&self) -> usize {
        0
    }

    fn set_real(&mut self, vrs: &[ValueRef], values: &[f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values) {
            match *vr {
                INPUT => self.u = *value,
                other => return Err(SlaveError::UnknownVariable(other)),
            }
        }
        Ok(())
    }

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values.iter_mut()) {
            *value = match *vr {
                INPUT => self.u,
                OUTPUT => self.x,
                other => return Err(SlaveError::UnknownVariable(other)),
            };
        }
        Ok(())
    }

    fn get_continuous_states(&mut self, states: &mut [f64]) -> Result<(), SlaveError> {
        states.copy_from_slice(&[self.x]);
        Ok(())
    }

    fn do_step(&mut self, _time: f64, step_size: f64) -> Result<(), SlaveError> {
        self.x += self.u * step_size;
        Ok(())
    }

    fn get_state(&mut self) -> Result<StateId, SlaveError> {
        let id = self.next_state;
        self.next_state += 1;
        self.saved.insert(id, (self.x, self.u));
        Ok(id)
    }

    fn set_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        let (x, u) = self
            .saved
            .get(&state)
            .copied()
            .ok_or(SlaveError::UnknownState(state))?;
        self.x = x;
        self.u = u;
        Ok(())
    }

    fn free_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        self.saved
            .remove(&state)
            .map(|_| ())
            .ok_or(SlaveError::UnknownState(state))
    }
}

/// `y = u / 2` while its steps stay at or below `max_step`. After a longer step the output is
/// `y = u + 1`, so a self-loop through it has no solution until it is rolled back.
pub struct StepLimited {
    name: String,
    max_step: f64,
    u: f64,
    last_step: f64,
    saved: HashMap<StateId, (f64, f64)>,
    next_state: StateId,
}

impl StepLimited {
    pub fn spawn(name: &str, max_step: f64) -> SlaveHandle {
        LocalTransport::spawn(Self {
            name: name.to_owned(),
            max_step,
            u: 0.0,
            last_step: 0.0,
            saved: HashMap::new(),
            next_state: 0,
        })
    }
}

impl Slave for StepLimited {
    fn description(&self) -> SlaveDescription {
        SlaveDescription::new(self.name.clone())
            .with_input(INPUT, "u", 0.0)
            .with_output(OUTPUT, "y", 0.0)
    }

    fn initialize(&mut self, _start_time: f64, _tolerance: Option<f64>) -> Result<(), SlaveError> {
        Ok(())
    }

    fn num_continuous_states(&self) -> usize {
        0
    }

    fn num_event_indicators(&self) -> usize {
        0
    }

    fn set_real(&mut self, vrs: &[ValueRef], values: &[f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values) {
            match *vr {
                INPUT => self.u = *value,
                other => return Err(SlaveError::UnknownVariable(other)),
            }
        }
        Ok(())
    }

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values.iter_mut()) {
            *value = match *vr {
                INPUT => self.u,
                OUTPUT if self.last_step > self.max_step => self.u + 1.0,
                OUTPUT => self.u / 2.0,
                other => return Err(SlaveError::UnknownVariable(other)),
            };
        }
        Ok(())
    }

    fn do_step(&mut self, _time: f64, step_size: f64) -> Result<(), SlaveError> {
        self.last_step = step_size;
        Ok(())
    }

    fn get_state(&mut self) -> Result<StateId, SlaveError> {
        let id = self.next_state;
        self.next_state += 1;
        self.saved.insert(id, (self.u, self.last_step));
        Ok(id)
    }

    fn set_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        (self.u, self.last_step) = self
            .saved
            .get(&state)
            .copied()
            .ok_or(SlaveError::UnknownState(state))?;
        Ok(())
    }

    fn free_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        self.saved
            .remove(&state)
            .map(|_| ())
            .ok_or(SlaveError::UnknownState(state))
    }
}

/// How a [`Misbehaving`] slave breaks.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Panics inside `do_step`; the worker reports a disconnect.
    PanicOnStep,
    /// Sleeps inside `do_step`.
    SlowStep(Duration),
    /// Reports one more continuous state on initialization than at registration.
    WrongStateCount,
    /// Returns an error from `do_step`.
    FailStep,
}

/// An [`Affine`] slave with one deliberate defect.
pub struct Misbehaving {
    inner: Affine,
    fault: Fault,
    initialized: bool,
}

impl Misbehaving {
    pub fn spawn(name: &str, fault: Fault) -> SlaveHandle {
        LocalTransport::spawn(Self {
            inner: Affine::new(name, 1.0, 0.0),
            fault,
            initialized: false,
        })
    }
}

impl Slave for Misbehaving {
    fn description(&self) -> SlaveDescription {
        self.inner.description()
    }

    fn initialize(&mut self, start_time: f64, tolerance: Option<f64>) -> Result<(), SlaveError> {
        self.initialized = true;
        self.inner.initialize(start_time, tolerance)
    }

    fn num_continuous_states(&self) -> usize {
        match self.fault {
            Fault::WrongStateCount if self.initialized => 1,
            _ => 0,
        }
    }

    fn num_event_indicators(&self) -> usize {
        0
    }

    fn set_real(&mut self, vrs: &[ValueRef], values: &[f64]) -> Result<(), SlaveError> {
        self.inner.set_real(vrs, values)
    }

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError> {
        self.inner.get_real(vrs, values)
    }

    fn do_step(&mut self, time: f64, step_size: f64) -> Result<(), SlaveError> {
        match self.fault {
            Fault::PanicOnStep => panic!("step failed hard"),
            Fault::SlowStep(delay) => thread::sleep(delay),
            Fault::FailStep => return Err(SlaveError::Failed("step rejected".to_owned())),
            Fault::WrongStateCount => {}
        }
        self.inner.do_step(time, step_size)
    }
}
