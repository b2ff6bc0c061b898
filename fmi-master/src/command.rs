//! Commands a master sends to its slaves, and the replies it expects back.
//!
//! The encoding of these messages on a wire is left to the transport.

use crate::ValueRef;

/// Per-proxy request sequence number. Responses echo the id of the request they answer.
pub type RequestId = u64;

/// Opaque handle to a state snapshot held by a slave.
pub type StateId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Instantiate,
    GetVersion,
    Initialize {
        start_time: f64,
        tolerance: Option<f64>,
    },
    SetReal {
        vrs: Vec<ValueRef>,
        values: Vec<f64>,
    },
    GetReal {
        vrs: Vec<ValueRef>,
    },
    /// Read the continuous states and event indicators.
    GetStates,
    /// Advance from `time` to `time + step_size`. The values of `outputs` are reported back
    /// with the step completion.
    DoStep {
        time: f64,
        step_size: f64,
        outputs: Vec<ValueRef>,
    },
    GetState,
    SetState(StateId),
    FreeState(StateId),
    DirectionalDerivative {
        unknowns: Vec<ValueRef>,
        knowns: Vec<ValueRef>,
        seed: Vec<f64>,
    },
    Terminate,
    Free,
}

/// Discriminant of a [`Command`], kept by a proxy for every outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Instantiate,
    GetVersion,
    Initialize,
    SetReal,
    GetReal,
    GetStates,
    DoStep,
    GetState,
    SetState,
    FreeState,
    DirectionalDerivative,
    Terminate,
    Free,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Instantiate => CommandKind::Instantiate,
            Command::GetVersion => CommandKind::GetVersion,
            Command::Initialize { .. } => CommandKind::Initialize,
            Command::SetReal { .. } => CommandKind::SetReal,
            Command::GetReal { .. } => CommandKind::GetReal,
            Command::GetStates => CommandKind::GetStates,
            Command::DoStep { .. } => CommandKind::DoStep,
            Command::GetState => CommandKind::GetState,
            Command::SetState(_) => CommandKind::SetState,
            Command::FreeState(_) => CommandKind::FreeState,
            Command::DirectionalDerivative { .. } => CommandKind::DirectionalDerivative,
            Command::Terminate => CommandKind::Terminate,
            Command::Free => CommandKind::Free,
        }
    }
}

impl CommandKind {
    /// Whether `reply` is a valid answer to a command of this kind. An error reply answers any
    /// command.
    pub fn accepts(self, reply: &Reply) -> bool {
        matches!(
            (self, reply),
            (_, Reply::Error(_))
                | (CommandKind::Instantiate, Reply::Instantiated)
                | (CommandKind::GetVersion, Reply::Version(_))
                | (CommandKind::Initialize, Reply::Initialized { .. })
                | (CommandKind::SetReal, Reply::SetReal)
                | (CommandKind::GetReal, Reply::Real { .. })
                | (CommandKind::GetStates, Reply::States { .. })
                | (CommandKind::DoStep, Reply::Stepped { .. })
                | (CommandKind::GetState, Reply::GotState(_))
                | (CommandKind::SetState, Reply::SetState)
                | (CommandKind::FreeState, Reply::FreedState)
                | (CommandKind::DirectionalDerivative, Reply::DirectionalDerivative(_))
                | (CommandKind::Terminate, Reply::Terminated)
                | (CommandKind::Free, Reply::Freed)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Instantiated,
    Version(String),
    /// Initialization done. The state counts are reported again and must match registration.
    Initialized {
        num_continuous_states: usize,
        num_event_indicators: usize,
    },
    SetReal,
    Real {
        vrs: Vec<ValueRef>,
        values: Vec<f64>,
    },
    States {
        states: Vec<f64>,
        indicators: Vec<f64>,
    },
    Stepped {
        time: f64,
        vrs: Vec<ValueRef>,
        values: Vec<f64>,
    },
    GotState(StateId),
    SetState,
    FreedState,
    DirectionalDerivative(Vec<f64>),
    Terminated,
    Freed,
    /// The slave could not carry out the command.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub reply: Reply,
}
