//! Stepping policies decide in which order slaves advance within one communication step.

use crate::{Command, Connections, Error, SlaveId};

use super::{coupling, dispatch::Dispatcher};

/// What a [`SteppingPolicy`] may do during a step: dispatch steps, wait, and exchange weak
/// couplings.
pub struct StepContext<'a> {
    pub(crate) dispatcher: &'a mut Dispatcher,
    pub(crate) connections: &'a Connections,
}

impl StepContext<'_> {
    pub fn num_slaves(&self) -> usize {
        self.dispatcher.num_slaves()
    }

    pub fn slaves(&self) -> impl Iterator<Item = SlaveId> {
        self.dispatcher.slaves()
    }

    /// Dispatch a step to `slave`, asking it to report all of its outputs with the reply.
    pub fn advance(&mut self, slave: SlaveId, time: f64, step_size: f64) -> Result<(), Error> {
        let outputs = self.dispatcher.proxy(slave)?.description().output_refs();
        self.dispatcher.send(
            slave,
            Command::DoStep {
                time,
                step_size,
                outputs,
            },
        )
    }

    pub fn advance_all(&mut self, time: f64, step_size: f64) -> Result<(), Error> {
        (0..self.num_slaves()).try_for_each(|i| self.advance(SlaveId(i), time, step_size))
    }

    /// Push the current outputs of `slave` along its outgoing weak connections.
    pub fn propagate_weak_from(&mut self, slave: SlaveId) -> Result<(), Error> {
        coupling::propagate_weak(
            self.dispatcher,
            self.connections.weak_connections(),
            Some(slave),
        )
        .map(|_| ())
    }

    pub fn send(&mut self, slave: SlaveId, command: Command) -> Result<(), Error> {
        self.dispatcher.send(slave, command)
    }

    pub fn wait(&mut self) -> Result<(), Error> {
        self.dispatcher.wait()
    }
}

pub trait SteppingPolicy: Send {
    fn name(&self) -> &'static str;

    /// Called once at the end of [`super::Coordinator::prepare`].
    fn prepare(&mut self, _ctx: &mut StepContext<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Advance every slave from `time` to `time + step_size`. Weak connections have already been
    /// propagated and loops solved for `time`.
    fn advance(
        &mut self,
        ctx: &mut StepContext<'_>,
        time: f64,
        step_size: f64,
    ) -> Result<(), Error>;

    /// Number of force outputs this policy adds per step. Zero for signal-coupled policies.
    fn num_force_outputs(&self) -> usize {
        0
    }
}

/// All slaves step concurrently on the inputs they had at the start of the step.
#[derive(Debug, Clone, Copy, Default)]
pub struct Jacobi;

impl SteppingPolicy for Jacobi {
    fn name(&self) -> &'static str {
        "jacobi"
    }

    fn advance(
        &mut self,
        ctx: &mut StepContext<'_>,
        time: f64,
        step_size: f64,
    ) -> Result<(), Error> {
        ctx.advance_all(time, step_size)?;
        ctx.wait()
    }
}

/// Slaves step one after another in registration order. After each step the slave's fresh
/// outputs are pushed to its consumers, so later slaves see values at `time + step_size`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussSeidel;

impl SteppingPolicy for GaussSeidel {
    fn name(&self) -> &'static str {
        "gauss-seidel"
    }

    fn advance(
        &mut self,
        ctx: &mut StepContext<'_>,
        time: f64,
        step_size: f64,
    ) -> Result<(), Error> {
        for slave in ctx.slaves().collect::<Vec<_>>() {
            ctx.advance(slave, time, step_size)?;
            ctx.wait()?;
            ctx.propagate_weak_from(slave)?;
        }
        Ok(())
    }
}
