//! Built-in coupled systems and the slaves they are made of.

use std::collections::HashMap;

use fmi_master::{
    me::{EventFlags, MeSlave, Model},
    traits::{Slave, SlaveError},
    transport::{LocalTransport, SlaveHandle},
    Connections, SlaveDescription, SlaveId, StateId, ValueRef, VariableDecl,
};

use crate::options::Scenario;

/// Default start, stop and step of a scenario.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Experiment {
    pub start_time: f64,
    pub stop_time: f64,
    pub step_size: f64,
}

pub struct Topology {
    pub slaves: Vec<SlaveHandle>,
    pub connections: Connections,
}

impl Scenario {
    pub fn default_experiment(&self) -> Experiment {
        match self {
            Scenario::AlgebraicLoop => Experiment {
                start_time: 0.0,
                stop_time: 1.0,
                step_size: 0.1,
            },
            Scenario::WeakChain => Experiment {
                start_time: 0.0,
                stop_time: 2.0,
                step_size: 0.05,
            },
            Scenario::Oscillator => Experiment {
                start_time: 0.0,
                stop_time: 10.0,
                step_size: 0.01,
            },
        }
    }

    /// Spawn the slaves of the scenario, each on its own worker thread.
    pub fn build(&self) -> Topology {
        let (a, b, c) = (SlaveId(0), SlaveId(1), SlaveId(2));
        match self {
            // a: y = 2 + sin(t) - x, b: out = u / 2
            Scenario::AlgebraicLoop => Topology {
                slaves: vec![
                    LocalTransport::spawn(Feedthrough::new("a", -1.0, 2.0).with_amplitude(1.0)),
                    LocalTransport::spawn(Feedthrough::new("b", 0.5, 0.0)),
                ],
                connections: Connections::default()
                    .strong((a, Feedthrough::OUTPUT), (b, Feedthrough::INPUT))
                    .strong((b, Feedthrough::OUTPUT), (a, Feedthrough::INPUT)),
            },
            Scenario::WeakChain => Topology {
                slaves: vec![
                    LocalTransport::spawn(
                        Feedthrough::new("source", 0.0, 0.0).with_amplitude(1.0),
                    ),
                    LocalTransport::spawn(Integrator::new("velocity")),
                    LocalTransport::spawn(Integrator::new("position")),
                ],
                connections: Connections::default()
                    .weak((a, Feedthrough::OUTPUT), (b, Integrator::INPUT))
                    .weak((b, Integrator::OUTPUT), (c, Integrator::INPUT)),
            },
            Scenario::Oscillator => {
                let step = self.default_experiment().step_size / 10.0;
                Topology {
                    slaves: vec![
                        LocalTransport::spawn(MeSlave::new("left", Oscillator::new(1.0), step)),
                        LocalTransport::spawn(MeSlave::new("right", Oscillator::new(0.0), step)),
                    ],
                    connections: Connections::default()
                        .weak((a, Oscillator::POSITION), (b, Oscillator::NEIGHBOUR))
                        .weak((b, Oscillator::POSITION), (a, Oscillator::NEIGHBOUR)),
                }
            }
        }
    }
}

/// Memoryless block `y = gain * u + offset + amplitude * sin(t)`.
#[derive(Debug, Clone)]
pub struct Feedthrough {
    name: String,
    gain: f64,
    offset: f64,
    amplitude: f64,
    time: f64,
    u: f64,
    saved: HashMap<StateId, (f64, f64)>,
    next_state: StateId,
}

impl Feedthrough {
    pub const INPUT: ValueRef = 0;
    pub const OUTPUT: ValueRef = 1;

    pub fn new(name: &str, gain: f64, offset: f64) -> Self {
        Self {
            name: name.to_owned(),
            gain,
            offset,
            amplitude: 0.0,
            time: 0.0,
            u: 0.0,
            saved: HashMap::new(),
            next_state: 0,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    fn output(&self) -> f64 {
        self.gain * self.u + self.offset + self.amplitude * self.time.sin()
    }
}

impl Slave for Feedthrough {
    fn description(&self) -> SlaveDescription {
        SlaveDescription::new(self.name.clone())
            .with_input(Self::INPUT, "u", 0.0)
            .with_output(Self::OUTPUT, "y", self.output())
    }

    fn initialize(&mut self, start_time: f64, _tolerance: Option<f64>) -> Result<(), SlaveError> {
        self.time = start_time;
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
                Self::INPUT => self.u = *value,
                other => return Err(SlaveError::UnknownVariable(other)),
            }
        }
        Ok(())
    }

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values.iter_mut()) {
            *value = match *vr {
                Self::INPUT => self.u,
                Self::OUTPUT => self.output(),
                other => return Err(SlaveError::UnknownVariable(other)),
            };
        }
        Ok(())
    }

    fn do_step(&mut self, time: f64, step_size: f64) -> Result<(), SlaveError> {
        self.time = time + step_size;
        Ok(())
    }

    fn get_state(&mut self) -> Result<StateId, SlaveError> {
        let id = self.next_state;
        self.next_state += 1;
        self.saved.insert(id, (self.time, self.u));
        Ok(id)
    }

    fn set_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        (self.time, self.u) = *self.saved.get(&state).ok_or(SlaveError::UnknownState(state))?;
        Ok(())
    }

    fn free_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        self.saved
            .remove(&state)
            .map(|_| ())
            .ok_or(SlaveError::UnknownState(state))
    }
}

/// `dx/dt = u`, integrated exactly over each communication step.
#[derive(Debug, Clone)]
pub struct Integrator {
    name: String,
    x: f64,
    u: f64,
    saved: HashMap<StateId, (f64, f64)>,
    next_state: StateId,
}

impl Integrator {
    pub const INPUT: ValueRef = 0;
    pub const OUTPUT: ValueRef = 1;

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            x: 0.0,
            u: 0.0,
            saved: HashMap::new(),
            next_state: 0,
        }
    }
}

impl Slave for Integrator {
    fn description(&self) -> SlaveDescription {
        SlaveDescription::new(self.name.clone())
            .with_states(1, 0)
            .with_input(Self::INPUT, "u", 0.0)
            .with_output(Self::OUTPUT, "x", 0.0)
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
                Self::INPUT => self.u = *value,
                other => return Err(SlaveError::UnknownVariable(other)),
            }
        }
        Ok(())
    }

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError> {
        for (vr, value) in vrs.iter().zip(values.iter_mut()) {
            *value = match *vr {
                Self::INPUT => self.u,
                Self::OUTPUT => self.x,
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
        (self.x, self.u) = *self.saved.get(&state).ok_or(SlaveError::UnknownState(state))?;
        Ok(())
    }

    fn free_state(&mut self, state: StateId) -> Result<(), SlaveError> {
        self.saved
            .remove(&state)
            .map(|_| ())
            .ok_or(SlaveError::UnknownState(state))
    }
}

/// Unit mass on a spring to the wall and a coupling spring to a neighbouring mass:
/// `x'' = -k x - c x' + k_c (x_n - x)`. Counts its zero crossings as events.
#[derive(Debug, Clone)]
pub struct Oscillator {
    x: f64,
    v: f64,
    neighbour: f64,
    k: f64,
    c: f64,
    coupling: f64,
    crossings: u32,
    positive: bool,
}

impl Oscillator {
    pub const NEIGHBOUR: ValueRef = 0;
    pub const POSITION: ValueRef = 1;
    pub const VELOCITY: ValueRef = 2;
    pub const CROSSINGS: ValueRef = 3;

    pub fn new(x0: f64) -> Self {
        Self {
            x: x0,
            v: 0.0,
            neighbour: 0.0,
            k: 4.0,
            c: 0.1,
            coupling: 1.0,
            crossings: 0,
            positive: x0 > 0.0,
        }
    }
}

impl Model for Oscillator {
    fn num_continuous_states(&self) -> usize {
        2
    }

    fn num_event_indicators(&self) -> usize {
        1
    }

    fn inputs(&self) -> Vec<VariableDecl> {
        vec![VariableDecl::new(Self::NEIGHBOUR, "x_neighbour", 0.0)]
    }

    fn outputs(&self) -> Vec<VariableDecl> {
        vec![
            VariableDecl::new(Self::POSITION, "x", self.x),
            VariableDecl::new(Self::VELOCITY, "v", self.v),
            VariableDecl::new(Self::CROSSINGS, "crossings", 0.0),
        ]
    }

    fn set_time(&mut self, _time: f64) {}

    fn get_continuous_states(&mut self, x: &mut [f64]) {
        x.copy_from_slice(&[self.x, self.v]);
    }

    fn set_continuous_states(&mut self, states: &[f64]) {
        self.x = states[0];
        self.v = states[1];
    }

    fn get_continuous_state_derivatives(&mut self, dx: &mut [f64]) {
        let a = -self.k * self.x - self.c * self.v + self.coupling * (self.neighbour - self.x);
        dx.copy_from_slice(&[self.v, a]);
    }

    fn get_event_indicators(&mut self, z: &mut [f64]) {
        z[0] = self.x;
    }

    fn update_discrete_states(&mut self, flags: &mut EventFlags) {
        flags.reset();
        let positive = self.x > 0.0;
        if positive != self.positive {
            self.positive = positive;
            self.crossings += 1;
        }
    }

    fn get_real(&mut self, vr: ValueRef) -> Result<f64, SlaveError> {
        match vr {
            Self::NEIGHBOUR => Ok(self.neighbour),
            Self::POSITION => Ok(self.x),
            Self::VELOCITY => Ok(self.v),
            Self::CROSSINGS => Ok(self.crossings as f64),
            _ => Err(SlaveError::UnknownVariable(vr)),
        }
    }

    fn set_real(&mut self, vr: ValueRef, value: f64) -> Result<(), SlaveError> {
        match vr {
            Self::NEIGHBOUR => self.neighbour = value,
            _ => return Err(SlaveError::UnknownVariable(vr)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::approx_eq;

    use super::*;

    #[test]
    fn test_feedthrough_state_round_trip() {
        let mut block = Feedthrough::new("a", 2.0, 1.0).with_amplitude(1.0);
        block.initialize(0.0, None).unwrap();
        block.set_real(&[Feedthrough::INPUT], &[3.0]).unwrap();
        let saved = block.get_state().unwrap();

        block.do_step(0.0, 0.5).unwrap();
        block.set_real(&[Feedthrough::INPUT], &[0.0]).unwrap();
        block.set_state(saved).unwrap();

        let mut y = [0.0];
        block.get_real(&[Feedthrough::OUTPUT], &mut y).unwrap();
        assert_eq!(y, [7.0]);
    }

    #[test]
    fn test_oscillator_derivatives() {
        let mut model = Oscillator::new(1.0);
        model.set_real(Oscillator::NEIGHBOUR, 0.5).unwrap();
        let mut dx = [0.0; 2];
        model.get_continuous_state_derivatives(&mut dx);
        assert!(approx_eq!(f64, dx[1], -4.0 - 0.5, epsilon = 1e-12));
    }

    #[test]
    fn test_topologies_validate() {
        for scenario in [
            Scenario::AlgebraicLoop,
            Scenario::WeakChain,
            Scenario::Oscillator,
        ] {
            let Topology {
                slaves,
                connections,
            } = scenario.build();
            fmi_master::master::Coordinator::new(
                slaves,
                connections,
                Box::new(fmi_master::master::Jacobi),
                Default::default(),
            )
            .unwrap();
        }
    }
}
