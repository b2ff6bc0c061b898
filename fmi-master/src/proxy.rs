//! Local stand-in for one remote slave.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    transport::{SlaveHandle, SlaveTransport},
    Command, CommandKind, Error, PendingRequests, Reply, Request, RequestId, Response,
    SlaveDescription, SlaveId, StateId, ValueRef,
};

#[derive(Debug, Clone)]
enum ProxyFault {
    Protocol(String),
    Disconnected(String),
}

/// A reply matched to the request it answers, waiting to be processed by the coordinator.
#[derive(Debug)]
pub(crate) struct Completion {
    pub id: RequestId,
    pub kind: CommandKind,
    pub reply: Reply,
}

#[derive(Debug, Default)]
struct Exchange {
    /// Requests in dispatch order. Replies must arrive in the same order.
    outstanding: VecDeque<(RequestId, CommandKind)>,
    inbox: VecDeque<Completion>,
    fault: Option<ProxyFault>,
}

#[derive(Debug)]
struct Shared {
    slave: SlaveId,
    tracker: Arc<PendingRequests>,
    exchange: Mutex<Exchange>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Exchange> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(&self, fault: ProxyFault) {
        log::error!("{}: {fault:?}", self.slave);
        self.lock().fault.get_or_insert(fault);
        self.tracker.raise_fault();
    }
}

/// Handed to the transport with every request; the transport reports the reply through it,
/// from whichever thread the reply arrives on.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    shared: Arc<Shared>,
}

impl ResponseHandle {
    pub fn slave(&self) -> SlaveId {
        self.shared.slave
    }

    /// Record the reply to the oldest outstanding request of this proxy.
    ///
    /// A reply that does not answer that request is a protocol error; it is not counted.
    pub fn on_response(&self, response: Response) {
        let mut exchange = self.shared.lock();
        let expected = exchange.outstanding.front().copied();
        match expected {
            Some((id, kind)) if id == response.id && kind.accepts(&response.reply) => {
                exchange.outstanding.pop_front();
                exchange.inbox.push_back(Completion {
                    id,
                    kind,
                    reply: response.reply,
                });
                drop(exchange);
                if !self.shared.tracker.decrement() {
                    self.shared.fault(ProxyFault::Protocol(format!(
                        "reply #{id} arrived with no request pending"
                    )));
                }
            }
            Some((id, kind)) => {
                drop(exchange);
                self.shared.fault(ProxyFault::Protocol(format!(
                    "expected reply to #{id} ({kind:?}), got #{} {:?}",
                    response.id, response.reply
                )));
            }
            None => {
                drop(exchange);
                self.shared.fault(ProxyFault::Protocol(format!(
                    "unsolicited reply #{} {:?}",
                    response.id, response.reply
                )));
            }
        }
    }

    /// The remote end is gone. Outstanding requests will never be answered.
    pub fn on_disconnect(&self, reason: impl Into<String>) {
        self.shared.fault(ProxyFault::Disconnected(reason.into()));
    }
}

/// Output values reported by one slave.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct OutputCache {
    /// Valid for the slave's current inputs. Cleared when the inputs are set.
    current: BTreeMap<ValueRef, f64>,
    /// Outputs at the last communication point. Replaced on step completion, completed by
    /// reads, and kept when the inputs are set.
    published: BTreeMap<ValueRef, f64>,
}

/// Proxy for one remote slave: identity, registration data, outstanding requests and the
/// last values the slave reported.
pub struct SlaveProxy {
    id: SlaveId,
    description: SlaveDescription,
    transport: Box<dyn SlaveTransport>,
    shared: Arc<Shared>,
    next_request: RequestId,

    outputs: OutputCache,
    states: Vec<f64>,
    indicators: Vec<f64>,
    version: Option<String>,
    time: Option<f64>,
    last_state: Option<StateId>,
    last_derivative: Vec<f64>,
}

impl std::fmt::Debug for SlaveProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveProxy")
            .field("id", &self.id)
            .field("name", &self.description.name)
            .field("outstanding", &self.num_outstanding())
            .finish()
    }
}

impl SlaveProxy {
    pub(crate) fn new(id: SlaveId, handle: SlaveHandle, tracker: Arc<PendingRequests>) -> Self {
        let SlaveHandle {
            description,
            transport,
        } = handle;
        Self {
            id,
            description,
            transport,
            shared: Arc::new(Shared {
                slave: id,
                tracker,
                exchange: Mutex::default(),
            }),
            next_request: 0,
            outputs: OutputCache::default(),
            states: Vec::new(),
            indicators: Vec::new(),
            version: None,
            time: None,
            last_state: None,
            last_derivative: Vec::new(),
        }
    }

    pub fn id(&self) -> SlaveId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn description(&self) -> &SlaveDescription {
        &self.description
    }

    /// `(num_continuous_states, num_event_indicators)` as captured at registration.
    pub fn reported_state_counts(&self) -> (usize, usize) {
        (
            self.description.num_continuous_states,
            self.description.num_event_indicators,
        )
    }

    /// Dispatch one command without waiting for the reply.
    pub fn send(&mut self, command: Command) -> Result<RequestId, Error> {
        let id = self.next_request;
        self.next_request += 1;
        let kind = command.kind();

        // Register before sending: the reply may arrive on another thread right away.
        self.shared.lock().outstanding.push_back((id, kind));
        self.shared.tracker.increment();
        log::trace!("{} <- #{id} {kind:?}", self.description.name);

        let handle = ResponseHandle {
            shared: self.shared.clone(),
        };
        if let Err(err) = self.transport.send(Request { id, command }, handle) {
            let mut exchange = self.shared.lock();
            if let Some(pos) = exchange.outstanding.iter().position(|(i, _)| *i == id) {
                exchange.outstanding.remove(pos);
                drop(exchange);
                self.shared.tracker.decrement();
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Number of requests sent to this slave and not yet answered.
    pub fn num_outstanding(&self) -> usize {
        self.shared.lock().outstanding.len()
    }

    /// Last value reported for `vr`, if it is still current.
    pub fn cached_value(&self, vr: ValueRef) -> Option<f64> {
        self.outputs.current.get(&vr).copied()
    }

    /// Value of output `vr` at the last communication point, unaffected by inputs set since.
    pub fn published_value(&self, vr: ValueRef) -> Option<f64> {
        self.outputs.published.get(&vr).copied()
    }

    /// Continuous states reported with the last [`Command::GetStates`].
    pub fn states(&self) -> &[f64] {
        &self.states
    }

    /// Event indicators reported with the last [`Command::GetStates`].
    pub fn indicators(&self) -> &[f64] {
        &self.indicators
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Time the slave reported after its last completed step.
    pub fn time(&self) -> Option<f64> {
        self.time
    }

    pub(crate) fn last_state(&self) -> Option<StateId> {
        self.last_state
    }

    pub(crate) fn last_derivative(&self) -> &[f64] {
        &self.last_derivative
    }

    pub(crate) fn outputs(&self) -> &OutputCache {
        &self.outputs
    }

    pub(crate) fn restore_outputs(&mut self, outputs: OutputCache) {
        self.outputs = outputs;
    }

    /// Make the current values of `vrs` the ones weak connections read.
    pub(crate) fn publish(&mut self, vrs: &[ValueRef]) {
        for vr in vrs {
            if let Some(value) = self.outputs.current.get(vr) {
                self.outputs.published.insert(*vr, *value);
            }
        }
    }

    pub(crate) fn check_fault(&self) -> Result<(), Error> {
        match &self.shared.lock().fault {
            None => Ok(()),
            Some(ProxyFault::Protocol(reason)) => Err(Error::Protocol {
                slave: self.id,
                reason: reason.clone(),
            }),
            Some(ProxyFault::Disconnected(reason)) => Err(Error::Disconnected {
                slave: self.id,
                reason: reason.clone(),
            }),
        }
    }

    pub(crate) fn take_completions(&self) -> Vec<Completion> {
        self.shared.lock().inbox.drain(..).collect()
    }

    fn protocol(&self, reason: String) -> Error {
        Error::Protocol {
            slave: self.id,
            reason,
        }
    }

    /// Fold a completed reply into the proxy's view of the slave.
    pub(crate) fn apply(&mut self, completion: &Completion) -> Result<(), Error> {
        log::trace!(
            "{} -> #{} {:?}",
            self.description.name,
            completion.id,
            completion.kind
        );
        match &completion.reply {
            Reply::Error(message) => {
                return Err(Error::Slave {
                    slave: self.id,
                    message: message.clone(),
                })
            }
            Reply::Version(version) => self.version = Some(version.clone()),
            Reply::Initialized {
                num_continuous_states,
                num_event_indicators,
            } => {
                let reported = (*num_continuous_states, *num_event_indicators);
                if reported != self.reported_state_counts() {
                    return Err(self.protocol(format!(
                        "reported {reported:?} continuous states/event indicators, \
                         registered with {:?}",
                        self.reported_state_counts()
                    )));
                }
            }
            // Inputs changed, so outputs with direct feedthrough may have too.
            Reply::SetReal => self.outputs.current.clear(),
            Reply::Real { vrs, values } => {
                if vrs.len() != values.len() {
                    return Err(self.protocol(format!(
                        "{} values reported for {} value references",
                        values.len(),
                        vrs.len()
                    )));
                }
                for (vr, value) in vrs.iter().zip(values) {
                    self.outputs.current.insert(*vr, *value);
                    self.outputs.published.entry(*vr).or_insert(*value);
                }
            }
            Reply::States { states, indicators } => {
                let reported = (states.len(), indicators.len());
                if reported != self.reported_state_counts() {
                    return Err(self.protocol(format!(
                        "reported {reported:?} continuous states/event indicators, \
                         registered with {:?}",
                        self.reported_state_counts()
                    )));
                }
                self.states.clone_from(states);
                self.indicators.clone_from(indicators);
            }
            Reply::Stepped { time, vrs, values } => {
                if vrs.len() != values.len() {
                    return Err(self.protocol(format!(
                        "{} values reported for {} value references",
                        values.len(),
                        vrs.len()
                    )));
                }
                self.outputs.current =
                    vrs.iter().copied().zip(values.iter().copied()).collect();
                self.outputs.published.clone_from(&self.outputs.current);
                self.time = Some(*time);
            }
            Reply::GotState(state) => self.last_state = Some(*state),
            Reply::DirectionalDerivative(values) => self.last_derivative = values.clone(),
            Reply::Instantiated
            | Reply::SetState
            | Reply::FreedState
            | Reply::Terminated
            | Reply::Freed => {}
        }
        Ok(())
    }
}
