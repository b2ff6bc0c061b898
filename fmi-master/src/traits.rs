//! The capability contract a simulation slave offers to the master, and the description it
//! registers with.

use crate::{StateId, ValueRef};

/// A real-valued variable declared by a slave.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDecl {
    pub vr: ValueRef,
    pub name: String,
    /// Declared start value, used as initial guess for loop unknowns.
    pub start: f64,
}

impl VariableDecl {
    pub fn new(vr: ValueRef, name: impl Into<String>, start: f64) -> Self {
        Self {
            vr,
            name: name.into(),
            start,
        }
    }
}

/// What a slave reports about itself at registration. Fixed for the proxy's lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlaveDescription {
    pub name: String,
    pub num_continuous_states: usize,
    pub num_event_indicators: usize,
    pub inputs: Vec<VariableDecl>,
    pub outputs: Vec<VariableDecl>,
}

impl SlaveDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_states(
        mut self,
        num_continuous_states: usize,
        num_event_indicators: usize,
    ) -> Self {
        self.num_continuous_states = num_continuous_states;
        self.num_event_indicators = num_event_indicators;
        self
    }

    pub fn with_input(mut self, vr: ValueRef, name: impl Into<String>, start: f64) -> Self {
        self.inputs.push(VariableDecl::new(vr, name, start));
        self
    }

    pub fn with_output(mut self, vr: ValueRef, name: impl Into<String>, start: f64) -> Self {
        self.outputs.push(VariableDecl::new(vr, name, start));
        self
    }

    pub fn input(&self, vr: ValueRef) -> Option<&VariableDecl> {
        self.inputs.iter().find(|v| v.vr == vr)
    }

    pub fn output(&self, vr: ValueRef) -> Option<&VariableDecl> {
        self.outputs.iter().find(|v| v.vr == vr)
    }

    /// Value references of all declared outputs, in declaration order.
    pub fn output_refs(&self) -> Vec<ValueRef> {
        self.outputs.iter().map(|v| v.vr).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SlaveError {
    #[error("Operation `{0}` is not supported by this slave")]
    Unsupported(&'static str),

    #[error("Unknown value reference {0}")]
    UnknownVariable(ValueRef),

    #[error("Unknown state {0}")]
    UnknownState(StateId),

    #[error("{0}")]
    Failed(String),
}

/// One simulation model instance as seen by the master.
///
/// Implementations are driven by a transport, one command at a time.
pub trait Slave: Send {
    fn description(&self) -> SlaveDescription;

    fn instantiate(&mut self) -> Result<(), SlaveError> {
        Ok(())
    }

    /// The FMI-standard version string
    fn get_version(&self) -> &str {
        "2.0"
    }

    fn initialize(&mut self, start_time: f64, tolerance: Option<f64>) -> Result<(), SlaveError>;

    fn num_continuous_states(&self) -> usize;

    fn num_event_indicators(&self) -> usize;

    fn set_real(&mut self, vrs: &[ValueRef], values: &[f64]) -> Result<(), SlaveError>;

    fn get_real(&mut self, vrs: &[ValueRef], values: &mut [f64]) -> Result<(), SlaveError>;

    /// Write the continuous states into `states`, sized by [`Self::num_continuous_states`].
    fn get_continuous_states(&mut self, states: &mut [f64]) -> Result<(), SlaveError> {
        if states.is_empty() {
            Ok(())
        } else {
            Err(SlaveError::Unsupported("get_continuous_states"))
        }
    }

    fn get_event_indicators(&mut self, indicators: &mut [f64]) -> Result<(), SlaveError> {
        if indicators.is_empty() {
            Ok(())
        } else {
            Err(SlaveError::Unsupported("get_event_indicators"))
        }
    }

    /// Advance the slave from `time` to `time + step_size`.
    fn do_step(&mut self, time: f64, step_size: f64) -> Result<(), SlaveError>;

    /// Capture the complete slave state and return a handle to it.
    fn get_state(&mut self) -> Result<StateId, SlaveError> {
        Err(SlaveError::Unsupported("get_state"))
    }

    fn set_state(&mut self, _state: StateId) -> Result<(), SlaveError> {
        Err(SlaveError::Unsupported("set_state"))
    }

    fn free_state(&mut self, _state: StateId) -> Result<(), SlaveError> {
        Err(SlaveError::Unsupported("free_state"))
    }

    /// Partial derivatives of `unknowns` with respect to `knowns`, multiplied by `seed`.
    fn directional_derivative(
        &mut self,
        _unknowns: &[ValueRef],
        _knowns: &[ValueRef],
        _seed: &[f64],
        _values: &mut [f64],
    ) -> Result<(), SlaveError> {
        Err(SlaveError::Unsupported("directional_derivative"))
    }

    fn terminate(&mut self) -> Result<(), SlaveError> {
        Ok(())
    }
}
