//! Model Exchange support: a fixed-step integrator around a [`Model`], with snapshots that
//! allow a step to be rolled back and retried.

mod slave;

pub use slave::MeSlave;

use crate::{traits::SlaveError, ValueRef, VariableDecl};

/// Flags a model raises while handling an event.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct EventFlags {
    /// Another event iteration is needed at the same time instant.
    pub discrete_states_need_update: bool,
    pub terminate_simulation: bool,
    pub nominals_of_continuous_states_changed: bool,
    /// A continuous state was re-initialized; the integrator must re-read the states.
    pub values_of_continuous_states_changed: bool,
    pub next_event_time: Option<f64>,
}

impl EventFlags {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Accumulate the flags of one event iteration into the flags of the whole event.
    fn absorb(&mut self, iteration: &EventFlags) {
        self.terminate_simulation |= iteration.terminate_simulation;
        self.nominals_of_continuous_states_changed |=
            iteration.nominals_of_continuous_states_changed;
        self.values_of_continuous_states_changed |= iteration.values_of_continuous_states_changed;
        self.discrete_states_need_update = iteration.discrete_states_need_update;
        self.next_event_time = iteration.next_event_time;
    }
}

/// A continuous-time model: states, their derivatives, event indicators and signal variables.
pub trait Model: Send {
    fn num_continuous_states(&self) -> usize;
    fn num_event_indicators(&self) -> usize;

    fn inputs(&self) -> Vec<VariableDecl>;
    fn outputs(&self) -> Vec<VariableDecl>;

    fn set_time(&mut self, time: f64);
    fn get_continuous_states(&mut self, x: &mut [f64]);
    fn set_continuous_states(&mut self, states: &[f64]);
    fn get_continuous_state_derivatives(&mut self, dx: &mut [f64]);
    fn get_event_indicators(&mut self, z: &mut [f64]);

    /// Handle an event at the current time. Called repeatedly while
    /// [`EventFlags::discrete_states_need_update`] is set.
    fn update_discrete_states(&mut self, flags: &mut EventFlags) {
        flags.reset();
    }

    fn get_real(&mut self, vr: ValueRef) -> Result<f64, SlaveError>;
    fn set_real(&mut self, vr: ValueRef, value: f64) -> Result<(), SlaveError>;
}

/// Everything the integrator needs to resume exactly where [`MeSimulation::store_states`] was
/// called.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub time: f64,
    pub step_size: f64,
    pub states: Vec<f64>,
    pub derivatives: Vec<f64>,
    pub indicators: Vec<f64>,
    pub previous_indicators: Vec<f64>,
    pub failed_steps: u64,
    pub event_flags: EventFlags,
}

/// Event iterations allowed at one time instant before the model is considered stuck.
const MAX_EVENT_ITERATIONS: usize = 100;

/// Explicit Euler integration of a [`Model`] with state-event localization.
///
/// The internal step is shortened to the remaining interval and halved while an event
/// indicator changes sign, until the crossing is bracketed to within `min_step_size`.
#[derive(Debug)]
pub struct MeSimulation<M> {
    model: M,
    time: f64,
    /// Current internal step size.
    step_size: f64,
    max_step_size: f64,
    min_step_size: f64,
    x: Vec<f64>,
    dx: Vec<f64>,
    z: Vec<f64>,
    prez: Vec<f64>,
    failed_steps: u64,
    event_flags: EventFlags,
}

impl<M: Model> MeSimulation<M> {
    pub fn new(model: M, max_step_size: f64) -> Self {
        let nx = model.num_continuous_states();
        let nz = model.num_event_indicators();
        Self {
            model,
            time: 0.0,
            step_size: max_step_size,
            max_step_size,
            min_step_size: max_step_size * 1e-6,
            x: vec![0.0; nx],
            dx: vec![0.0; nx],
            z: vec![0.0; nz],
            prez: vec![0.0; nz],
            failed_steps: 0,
            event_flags: EventFlags::default(),
        }
    }

    pub fn with_min_step_size(mut self, min_step_size: f64) -> Self {
        self.min_step_size = min_step_size;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Internal steps rejected because an event indicator crossed zero inside them.
    pub fn failed_steps(&self) -> u64 {
        self.failed_steps
    }

    pub fn event_flags(&self) -> &EventFlags {
        &self.event_flags
    }

    /// Set the start time and settle any events present in the initial state.
    pub fn prepare(&mut self, start_time: f64) -> Result<(), SlaveError> {
        self.time = start_time;
        self.step_size = self.max_step_size;
        self.failed_steps = 0;
        self.model.set_time(start_time);
        self.handle_event()?;
        Ok(())
    }

    pub fn store_states(&mut self) -> Snapshot {
        let mut snapshot = Snapshot {
            time: 0.0,
            step_size: 0.0,
            states: Vec::new(),
            derivatives: Vec::new(),
            indicators: Vec::new(),
            previous_indicators: Vec::new(),
            failed_steps: 0,
            event_flags: EventFlags::default(),
        };
        self.store_states_into(&mut snapshot);
        snapshot
    }

    /// Like [`Self::store_states`], reusing the buffers of `snapshot`.
    pub fn store_states_into(&mut self, snapshot: &mut Snapshot) {
        self.model.get_continuous_states(&mut self.x);
        self.model.get_continuous_state_derivatives(&mut self.dx);
        self.model.get_event_indicators(&mut self.z);

        snapshot.time = self.time;
        snapshot.step_size = self.step_size;
        snapshot.states.clone_from(&self.x);
        snapshot.derivatives.clone_from(&self.dx);
        snapshot.indicators.clone_from(&self.z);
        snapshot.previous_indicators.clone_from(&self.prez);
        snapshot.failed_steps = self.failed_steps;
        snapshot.event_flags.clone_from(&self.event_flags);
    }

    pub fn restore_states(&mut self, snapshot: &Snapshot) {
        self.time = snapshot.time;
        self.step_size = snapshot.step_size;
        self.x.clone_from(&snapshot.states);
        self.dx.clone_from(&snapshot.derivatives);
        self.z.clone_from(&snapshot.indicators);
        self.prez.clone_from(&snapshot.previous_indicators);
        self.failed_steps = snapshot.failed_steps;
        self.event_flags.clone_from(&snapshot.event_flags);

        self.model.set_time(self.time);
        self.model.set_continuous_states(&self.x);
    }

    /// Integrate from `time` to `time + step_size`, stopping at state and time events on the
    /// way. Returns the number of events handled.
    pub fn advance_to(&mut self, time: f64, step_size: f64) -> Result<usize, SlaveError> {
        if self.time != time {
            log::debug!("Integrator moved from t = {} to t = {time}", self.time);
            self.time = time;
            self.model.set_time(time);
        }
        let target = time + step_size;
        let mut events = 0;

        while self.time < target {
            let mut h = self.step_size.min(target - self.time);
            if h <= 0.0 {
                break;
            }
            let time_event = self
                .event_flags
                .next_event_time
                .filter(|te| *te > self.time && *te - self.time <= h);
            if let Some(te) = time_event {
                h = te - self.time;
            }

            self.model.get_continuous_states(&mut self.x);
            self.model.get_continuous_state_derivatives(&mut self.dx);
            let start = self.x.clone();
            for (x, dx) in self.x.iter_mut().zip(&self.dx) {
                *x += dx * h;
            }
            self.model.set_time(self.time + h);
            self.model.set_continuous_states(&self.x);

            if self.crossed_zero() && h > self.min_step_size {
                self.failed_steps += 1;
                self.step_size = h / 2.0;
                self.model.set_time(self.time);
                self.model.set_continuous_states(&start);
                continue;
            }

            self.time += h;
            let state_event = self.crossed_zero();
            if state_event || time_event.is_some() {
                log::trace!(
                    "Event at t = {} [state: {state_event}, time: {}]",
                    self.time,
                    time_event.is_some()
                );
                events += 1;
                self.handle_event()?;
                self.step_size = self.max_step_size;
            } else {
                self.prez.clone_from(&self.z);
            }

            if self.event_flags.terminate_simulation {
                return Err(SlaveError::Failed(format!(
                    "model requested termination at t = {}",
                    self.time
                )));
            }
        }

        Ok(events)
    }

    /// Evaluate the event indicators and compare their signs with the last accepted step.
    fn crossed_zero(&mut self) -> bool {
        if self.z.is_empty() {
            return false;
        }
        self.model.get_event_indicators(&mut self.z);
        self.z
            .iter()
            .zip(&self.prez)
            .any(|(z, prez)| (*prez <= 0.0 && *z > 0.0) || (*prez > 0.0 && *z <= 0.0))
    }

    fn handle_event(&mut self) -> Result<(), SlaveError> {
        self.event_flags.reset();
        let mut iteration = EventFlags::default();
        for _ in 0..MAX_EVENT_ITERATIONS {
            iteration.reset();
            self.model.update_discrete_states(&mut iteration);
            self.event_flags.absorb(&iteration);
            if !iteration.discrete_states_need_update || iteration.terminate_simulation {
                if !self.z.is_empty() {
                    self.model.get_event_indicators(&mut self.z);
                    self.prez.clone_from(&self.z);
                }
                return Ok(());
            }
        }
        Err(SlaveError::Failed(format!(
            "event iteration did not settle after {MAX_EVENT_ITERATIONS} iterations at t = {}",
            self.time
        )))
    }
}
