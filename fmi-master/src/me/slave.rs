use std::collections::HashMap;

use crate::{
    traits::{Slave, SlaveError},
    SlaveDescription, StateId, ValueRef,
};

use super::{MeSimulation, Model, Snapshot};

/// Presents a [`MeSimulation`] as a co-simulation slave. Saved slave states are integrator
/// [`Snapshot`]s.
#[derive(Debug)]
pub struct MeSlave<M> {
    name: String,
    sim: MeSimulation<M>,
    snapshots: HashMap<StateId, Snapshot>,
    next_state: StateId,
}

impl<M: Model> MeSlave<M> {
    pub fn new(name: impl Into<String>, model: M, max_step_size: f64) -> Self {
        Self {
            name: name.into(),
            sim: MeSimulation::new(model, max_step_size),
            snapshots: HashMap::new(),
            next_state: 0,
        }
    }

    pub fn simulation(&self) -> &MeSimulation<M> {
        &self.sim
    }
}

impl<M: Model> Slave for MeSlave<M> {
    fn description(&self) -> SlaveDescription {
        let model = self.sim.model();
        let mut description = SlaveDescription::new(self.name.clone())
            .with_states(model.num_continuous_states(), model.num_event_indicators());
        description.inputs = model.inputs();
        description.outputs = model.outputs();
        description
    }

    fn initialize(&mut self, start_time: f64, _tolerance: Option<f64>) -> Result<(), SlaveError> {
        self.sim.prepare(start_time)
    }

    fn num_continuous_states(&self) -> usize {
        self.sim.model().num_continuous_states()
    }

    fn num_event_indicators(&self) -> usize {
        self.sim.model().num_event_indicators()
    }

    fn set_real(&mut self, vrs: &[ValueRef], values: &[f64]) -> Result<(), SlaveError> {
        let model = self.sim.model_mut();
        vrs.iter()
            .zip(values)
            .try_for_each(|(vr, value)| model.set_real(*vr, *value))
    }

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError> {
        let model = self.sim.model_mut();
        for (vr, value) in vrs.iter().zip(values.iter_mut()) {
            *value = model.get_real(*vr)?;
        }
        Ok(())
    }

    fn get_continuous_states(&mut self, states: &mut [f64]) -> Result<(), SlaveError> {
        self.sim.model_mut().get_continuous_states(states);
        Ok(())
    }

    fn get_event_indicators(&mut self, indicators: &mut [f64]) -> Result<(), SlaveError> {
        self.sim.model_mut().get_event_indicators(indicators);
        Ok(())
    }

    fn do_step(&mut self, time: f64, step_size: f64) -> Result<(), SlaveError> {
        let events = self.sim.advance_to(time, step_size)?;
        if events > 0 {
            log::trace!("{}: {events} event(s) in [{time}, {}]", self.name, time + step_size);
        }
        Ok(())
    }

    fn get_state(&mut self) -> Result<StateId, SlaveError> {
        let id = self.next_state;
        self.next_state += 1;
        self.snapshots.insert(id, self.sim.store_states());
        Ok(id)
    }

    fn set_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        let snapshot = self
            .snapshots
            .get(&state)
            .ok_or(SlaveError::UnknownState(state))?;
        self.sim.restore_states(snapshot);
        Ok(())
    }

    fn free_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        self.snapshots
            .remove(&state)
            .map(|_| ())
            .ok_or(SlaveError::UnknownState(state))
    }
}
