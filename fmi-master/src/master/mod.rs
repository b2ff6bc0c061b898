//! The coordinator: lifecycle, communication steps, algebraic loops and rollback.

use std::time::Duration;

use crate::{
    proxy::OutputCache,
    solver::{Broyden, RootFinder, SolveReport, SolverOptions},
    transport::SlaveHandle,
    Command, Connections, Error, IterationStorage, SlaveId, SlaveProxy, StateId, ValueRef,
};

mod coupling;
mod dispatch;
pub mod events;
mod policy;

pub use dispatch::Dispatcher;
pub use events::{EventData, Listeners, SlaveEvent, SlaveEventKind};
pub use policy::{GaussSeidel, Jacobi, StepContext, SteppingPolicy};

use coupling::LoopPlan;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MasterState {
    /// Slaves registered, nothing sent yet.
    Constructed,
    /// Slaves instantiated and initialized, loops solved at the start time.
    Prepared,
    /// At least one communication step completed; `time` is where the slaves are now.
    Stepping { time: f64 },
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterOptions {
    /// Upper bound on a single barrier. `None` blocks until every reply has arrived.
    pub wait_timeout: Option<Duration>,
    pub solver: SolverOptions,
    /// Tolerance forwarded to the slaves on initialization.
    pub slave_tolerance: Option<f64>,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Some(Duration::from_secs(60)),
            solver: SolverOptions::default(),
            slave_tolerance: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterStats {
    pub requests_sent: usize,
    pub barriers: usize,
    pub steps: usize,
    pub loop_solves: usize,
    pub residual_evaluations: usize,
}

/// Everything needed to put the coupled system back where [`Coordinator::save_states`] found
/// it. Release the slave-side states with [`Coordinator::free_states`].
#[derive(Debug, Clone, PartialEq)]
pub struct MasterSnapshot {
    states: Vec<StateId>,
    outputs: Vec<OutputCache>,
    loop_guess: Vec<f64>,
    state: MasterState,
}

impl MasterSnapshot {
    pub fn master_state(&self) -> MasterState {
        self.state
    }
}

/// Drives a set of slaves through synchronized communication steps.
pub struct Coordinator {
    dispatcher: Dispatcher,
    connections: Connections,
    plan: LoopPlan,
    storage: IterationStorage,
    root_finder: Box<dyn RootFinder>,
    policy: Box<dyn SteppingPolicy>,
    options: MasterOptions,
    state: MasterState,
    start_time: f64,
    /// Last converged loop solution, the starting guess for the next solve.
    loop_guess: Vec<f64>,
    steps: usize,
    loop_solves: usize,
    residual_evaluations: usize,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.state)
            .field("policy", &self.policy.name())
            .field("slaves", &self.dispatcher.num_slaves())
            .field("loop_unknowns", &self.plan.len())
            .finish()
    }
}

impl Coordinator {
    /// Register `slaves` (their [`SlaveId`]s are their indices) and validate the topology.
    pub fn new(
        slaves: Vec<SlaveHandle>,
        connections: Connections,
        policy: Box<dyn SteppingPolicy>,
        options: MasterOptions,
    ) -> Result<Self, Error> {
        if slaves.is_empty() {
            return Err(Error::Config("at least one slave is required".to_owned()));
        }
        let descriptions = slaves.iter().map(|s| &s.description).collect::<Vec<_>>();
        connections.validate(&descriptions)?;

        let dispatcher = Dispatcher::new(slaves, options.wait_timeout);
        let plan = LoopPlan::new(connections.strong_connections(), &dispatcher)?;
        let counts = dispatcher
            .proxies()
            .iter()
            .map(SlaveProxy::reported_state_counts)
            .collect::<Vec<_>>();
        let storage = IterationStorage::allocate(&counts, plan.len());
        let loop_guess = plan.initial_guess(&dispatcher)?;

        log::debug!(
            "Registered {} slave(s), {} weak and {} strong connection(s), {} policy",
            dispatcher.num_slaves(),
            connections.weak_connections().len(),
            connections.strong_connections().len(),
            policy.name()
        );

        Ok(Self {
            dispatcher,
            connections,
            plan,
            storage,
            root_finder: Box::new(Broyden::default()),
            policy,
            options,
            state: MasterState::Constructed,
            start_time: 0.0,
            loop_guess,
            steps: 0,
            loop_solves: 0,
            residual_evaluations: 0,
        })
    }

    /// Replace the default [`Broyden`] loop solver.
    pub fn with_root_finder(mut self, root_finder: impl RootFinder + 'static) -> Self {
        self.root_finder = Box::new(root_finder);
        self
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    /// Where the slaves are in time, once prepared.
    pub fn time(&self) -> Option<f64> {
        match self.state {
            MasterState::Prepared => Some(self.start_time),
            MasterState::Stepping { time } => Some(time),
            MasterState::Constructed | MasterState::Terminated => None,
        }
    }

    pub fn options(&self) -> &MasterOptions {
        &self.options
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn proxies(&self) -> &[SlaveProxy] {
        self.dispatcher.proxies()
    }

    pub fn proxy(&self, slave: SlaveId) -> Result<&SlaveProxy, Error> {
        self.dispatcher.proxy(slave)
    }

    pub fn storage(&self) -> &IterationStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut IterationStorage {
        &mut self.storage
    }

    pub fn listeners_mut(&mut self) -> &mut Listeners {
        self.dispatcher.listeners_mut()
    }

    /// Register a handler for one kind of slave event.
    pub fn on(
        &mut self,
        kind: SlaveEventKind,
        handler: impl FnMut(&SlaveEvent<'_>) + Send + 'static,
    ) {
        self.dispatcher.listeners_mut().on(kind, handler);
    }

    pub fn stats(&self) -> MasterStats {
        MasterStats {
            requests_sent: self.dispatcher.requests_sent(),
            barriers: self.dispatcher.barriers(),
            steps: self.steps,
            loop_solves: self.loop_solves,
            residual_evaluations: self.residual_evaluations,
        }
    }

    /// Requests dispatched and not yet answered, across all slaves.
    pub fn get_num_pending_requests(&self) -> usize {
        self.dispatcher.num_pending()
    }

    pub fn get_num_force_outputs(&self) -> usize {
        self.policy.num_force_outputs()
    }

    pub fn send(&mut self, slave: SlaveId, command: Command) -> Result<(), Error> {
        self.dispatcher.send(slave, command)
    }

    pub fn send_many(&mut self, slaves: &[SlaveId], command: &Command) -> Result<(), Error> {
        self.dispatcher.send_many(slaves, command)
    }

    pub fn wait(&mut self) -> Result<(), Error> {
        self.dispatcher.wait()
    }

    pub fn send_wait(&mut self, slave: SlaveId, command: Command) -> Result<(), Error> {
        self.dispatcher.send_wait(slave, command)
    }

    pub fn send_wait_many(&mut self, slaves: &[SlaveId], command: &Command) -> Result<(), Error> {
        self.dispatcher.send_many(slaves, command)?;
        self.dispatcher.wait()
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: impl Fn(&MasterState) -> bool,
    ) -> Result<(), Error> {
        if allowed(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn expect_running(&self, operation: &'static str) -> Result<(), Error> {
        self.expect_state(operation, |s| {
            matches!(s, MasterState::Prepared | MasterState::Stepping { .. })
        })
    }

    /// Instantiate and initialize every slave, fetch their outputs and solve the loops at
    /// `start_time`.
    pub fn prepare(&mut self, start_time: f64) -> Result<(), Error> {
        self.expect_state("prepare", |s| matches!(s, MasterState::Constructed))?;
        log::info!(
            "Preparing {} slave(s) at t = {start_time}",
            self.dispatcher.num_slaves()
        );

        self.dispatcher.send_all(&Command::Instantiate)?;
        self.dispatcher.wait()?;
        self.dispatcher.send_all(&Command::GetVersion)?;
        self.dispatcher.send_all(&Command::Initialize {
            start_time,
            tolerance: self.options.slave_tolerance,
        })?;
        self.dispatcher.wait()?;

        let with_outputs = self
            .dispatcher
            .proxies()
            .iter()
            .filter(|p| !p.description().outputs.is_empty())
            .map(|p| (p.id(), p.description().output_refs()))
            .collect::<Vec<_>>();
        for (slave, vrs) in with_outputs {
            self.dispatcher.send(slave, Command::GetReal { vrs })?;
        }
        self.dispatcher.wait()?;

        self.solve_loops()?;

        let mut ctx = StepContext {
            dispatcher: &mut self.dispatcher,
            connections: &self.connections,
        };
        self.policy.prepare(&mut ctx)?;

        self.start_time = start_time;
        self.state = MasterState::Prepared;
        Ok(())
    }

    /// Copy producer outputs to consumer inputs along every weak connection.
    pub fn propagate_weak(&mut self) -> Result<(), Error> {
        coupling::propagate_weak(
            &mut self.dispatcher,
            self.connections.weak_connections(),
            None,
        )
        .map(|_| ())
    }

    /// Solve the strong connections so that every consumer input equals its producer's output.
    ///
    /// Returns `None` without any network traffic if there are no strong connections. On failure
    /// the replies still in flight are drained before the error is returned, unless the
    /// failure left the reply streams unusable.
    pub fn solve_loops(&mut self) -> Result<Option<SolveReport>, Error> {
        if self.plan.is_empty() {
            return Ok(None);
        }

        let Self {
            dispatcher,
            plan,
            storage,
            root_finder,
            options,
            loop_guess,
            ..
        } = self;

        let mut x = loop_guess.clone();
        let mut evaluations = 0;
        let result = {
            let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
                evaluations += 1;
                plan.evaluate(dispatcher, storage, x, f)
            };
            root_finder.solve(&mut residual, &mut x, &options.solver)
        };
        self.loop_solves += 1;
        self.residual_evaluations += evaluations;

        match result {
            Ok(report) => {
                log::debug!(
                    "Loop solved in {} evaluation(s), |f| = {:e}",
                    report.evaluations,
                    report.residual_norm
                );
                self.loop_guess = x;
                self.plan.publish(&mut self.dispatcher)?;
                Ok(Some(report))
            }
            Err(Error::Convergence(mut failure)) => {
                failure.unknowns = self.plan.labels().to_vec();
                self.dispatcher.drain();
                Err(Error::Convergence(failure))
            }
            Err(err) => {
                if !err.is_fatal() {
                    self.dispatcher.drain();
                }
                Err(err)
            }
        }
    }

    /// Advance the coupled system from `time` to `time + step_size`.
    ///
    /// Weak connections are propagated and loops solved at `time`, the policy advances the
    /// slaves, and the loops are solved once more at `time + step_size`. `time` must be where the
    /// slaves are now. If this fails the slaves may already have stepped; roll back with
    /// [`Self::restore_states`] before retrying.
    pub fn run_iteration(&mut self, time: f64, step_size: f64) -> Result<(), Error> {
        self.expect_running("run_iteration")?;
        if !(step_size > 0.0 && step_size.is_finite()) {
            return Err(Error::Config(format!(
                "step size must be positive and finite, got {step_size}"
            )));
        }
        if let Some(now) = self.time() {
            if (time - now).abs() > 1e-9 * now.abs().max(1.0) {
                return Err(Error::Config(format!(
                    "step starts at t = {time}, but the slaves are at t = {now}"
                )));
            }
        }

        self.propagate_weak()?;
        self.solve_loops()?;

        let mut ctx = StepContext {
            dispatcher: &mut self.dispatcher,
            connections: &self.connections,
        };
        self.policy.advance(&mut ctx, time, step_size)?;
        ctx.wait()?;

        // Make the loop consistent again with the outputs at the end of the step.
        self.solve_loops()?;

        self.steps += 1;
        self.state = MasterState::Stepping {
            time: time + step_size,
        };
        log::trace!("Step {} completed at t = {}", self.steps, time + step_size);
        Ok(())
    }

    /// Read `vrs` from one slave, blocking until the values arrive.
    pub fn get_real(&mut self, slave: SlaveId, vrs: &[ValueRef]) -> Result<Vec<f64>, Error> {
        self.send_wait(slave, Command::GetReal { vrs: vrs.to_vec() })?;
        let proxy = self.dispatcher.proxy(slave)?;
        vrs.iter()
            .map(|vr| {
                proxy.cached_value(*vr).ok_or_else(|| Error::Protocol {
                    slave,
                    reason: format!("no value reported for {vr}"),
                })
            })
            .collect()
    }

    pub fn set_real(
        &mut self,
        slave: SlaveId,
        vrs: &[ValueRef],
        values: &[f64],
    ) -> Result<(), Error> {
        if vrs.len() != values.len() {
            return Err(Error::Config(format!(
                "{} values given for {} value references",
                values.len(),
                vrs.len()
            )));
        }
        self.send_wait(
            slave,
            Command::SetReal {
                vrs: vrs.to_vec(),
                values: values.to_vec(),
            },
        )
    }

    /// Directional derivative of `unknowns` with respect to `knowns` along `seed`, evaluated
    /// by the slave.
    pub fn directional_derivative(
        &mut self,
        slave: SlaveId,
        unknowns: &[ValueRef],
        knowns: &[ValueRef],
        seed: &[f64],
    ) -> Result<Vec<f64>, Error> {
        self.send_wait(
            slave,
            Command::DirectionalDerivative {
                unknowns: unknowns.to_vec(),
                knowns: knowns.to_vec(),
                seed: seed.to_vec(),
            },
        )?;
        Ok(self.dispatcher.proxy(slave)?.last_derivative().to_vec())
    }

    /// Ask every slave to store its full state.
    pub fn save_states(&mut self) -> Result<MasterSnapshot, Error> {
        self.expect_running("save_states")?;
        self.dispatcher.send_all(&Command::GetState)?;
        self.dispatcher.wait()?;

        let proxies = self.dispatcher.proxies();
        let states = proxies
            .iter()
            .map(|p| {
                p.last_state().ok_or_else(|| Error::Protocol {
                    slave: p.id(),
                    reason: "no state reported".to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MasterSnapshot {
            states,
            outputs: proxies.iter().map(|p| p.outputs().clone()).collect(),
            loop_guess: self.loop_guess.clone(),
            state: self.state,
        })
    }

    /// Roll every slave back to `snapshot`. The snapshot stays valid and can be restored again.
    pub fn restore_states(&mut self, snapshot: &MasterSnapshot) -> Result<(), Error> {
        self.expect_running("restore_states")?;
        for (index, state) in snapshot.states.iter().enumerate() {
            self.dispatcher.send(SlaveId(index), Command::SetState(*state))?;
        }
        self.dispatcher.wait()?;

        for (proxy, outputs) in self
            .dispatcher
            .proxies_mut()
            .iter_mut()
            .zip(&snapshot.outputs)
        {
            proxy.restore_outputs(outputs.clone());
        }
        self.loop_guess.clone_from(&snapshot.loop_guess);
        self.state = snapshot.state;
        log::debug!("Restored states saved at {:?}", snapshot.state);
        Ok(())
    }

    pub fn free_states(&mut self, snapshot: MasterSnapshot) -> Result<(), Error> {
        for (index, state) in snapshot.states.into_iter().enumerate() {
            self.dispatcher.send(SlaveId(index), Command::FreeState(state))?;
        }
        self.dispatcher.wait()
    }

    /// Terminate and free every slave.
    pub fn terminate(&mut self) -> Result<(), Error> {
        self.expect_running("terminate")?;
        log::info!("Terminating after {} step(s)", self.steps);
        self.dispatcher.send_all(&Command::Terminate)?;
        self.dispatcher.wait()?;
        self.dispatcher.send_all(&Command::Free)?;
        self.dispatcher.wait()?;
        self.state = MasterState::Terminated;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
