//! The seam between slave proxies and whatever carries their messages.

#[cfg(feature = "local")]
mod local;

#[cfg(feature = "local")]
pub use local::LocalTransport;

use crate::{traits::Slave, Command, Error, Reply, Request, ResponseHandle, SlaveDescription};

/// Carries requests to one slave and reports its replies.
pub trait SlaveTransport: Send {
    /// Queue `request` for delivery. Must not block on the reply, which is reported later through
    /// [`ResponseHandle::on_response`], possibly from another thread. Replies to one transport
    /// must be reported in request order.
    fn send(&mut self, request: Request, replies: ResponseHandle) -> Result<(), Error>;
}

/// A slave ready to be registered with a coordinator.
pub struct SlaveHandle {
    pub description: SlaveDescription,
    pub transport: Box<dyn SlaveTransport>,
}

impl SlaveHandle {
    pub fn new(description: SlaveDescription, transport: impl SlaveTransport + 'static) -> Self {
        Self {
            description,
            transport: Box::new(transport),
        }
    }
}

/// Carry out one command on `slave` and build the reply for it.
pub fn serve<S: Slave + ?Sized>(slave: &mut S, command: Command) -> Reply {
    let result = match command {
        Command::Instantiate => slave.instantiate().map(|_| Reply::Instantiated),
        Command::GetVersion => Ok(Reply::Version(slave.get_version().to_owned())),
        Command::Initialize {
            start_time,
            tolerance,
        } => slave
            .initialize(start_time, tolerance)
            .map(|_| Reply::Initialized {
                num_continuous_states: slave.num_continuous_states(),
                num_event_indicators: slave.num_event_indicators(),
            }),
        Command::SetReal { vrs, values } => {
            slave.set_real(&vrs, &values).map(|_| Reply::SetReal)
        }
        Command::GetReal { vrs } => {
            let mut values = vec![0.0; vrs.len()];
            slave
                .get_real(&vrs, &mut values)
                .map(|_| Reply::Real { vrs, values })
        }
        Command::GetStates => {
            let mut states = vec![0.0; slave.num_continuous_states()];
            let mut indicators = vec![0.0; slave.num_event_indicators()];
            slave
                .get_continuous_states(&mut states)
                .and_then(|_| slave.get_event_indicators(&mut indicators))
                .map(|_| Reply::States { states, indicators })
        }
        Command::DoStep {
            time,
            step_size,
            outputs,
        } => slave.do_step(time, step_size).and_then(|_| {
            let mut values = vec![0.0; outputs.len()];
            slave.get_real(&outputs, &mut values)?;
            Ok(Reply::Stepped {
                time: time + step_size,
                vrs: outputs,
                values,
            })
        }),
        Command::GetState => slave.get_state().map(Reply::GotState),
        Command::SetState(state) => slave.set_state(state).map(|_| Reply::SetState),
        Command::FreeState(state) => slave.free_state(state).map(|_| Reply::FreedState),
        Command::DirectionalDerivative {
            unknowns,
            knowns,
            seed,
        } => {
            let mut values = vec![0.0; unknowns.len()];
            slave
                .directional_derivative(&unknowns, &knowns, &seed, &mut values)
                .map(|_| Reply::DirectionalDerivative(values))
        }
        Command::Terminate => slave.terminate().map(|_| Reply::Terminated),
        Command::Free => Ok(Reply::Freed),
    };

    result.unwrap_or_else(|err| Reply::Error(err.to_string()))
}
