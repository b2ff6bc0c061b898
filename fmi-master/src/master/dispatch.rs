use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    tracker::WaitOutcome, transport::SlaveHandle, Command, Error, PendingRequests, Reply,
    SlaveId, SlaveProxy,
};

use super::events::{EventData, Listeners, SlaveEvent};

/// Owns the slave proxies and the shared request tracker. Implements the send/wait barrier
/// and turns processed replies into lifecycle events.
#[derive(Debug)]
pub struct Dispatcher {
    proxies: Vec<SlaveProxy>,
    tracker: Arc<PendingRequests>,
    listeners: Listeners,
    wait_timeout: Option<Duration>,
    requests_sent: usize,
    barriers: usize,
}

fn event_data(reply: &Reply) -> Option<EventData<'_>> {
    Some(match reply {
        Reply::Instantiated => EventData::Instantiated,
        Reply::Version(version) => EventData::GotVersion(version),
        Reply::Initialized { .. } => EventData::Initialized,
        Reply::SetReal => EventData::SetReal,
        Reply::Stepped { time, vrs, values } => EventData::Stepped {
            time: *time,
            vrs,
            values,
        },
        Reply::GotState(state) => EventData::GotState(*state),
        Reply::SetState => EventData::SetState,
        Reply::FreedState => EventData::FreedState,
        Reply::DirectionalDerivative(values) => EventData::DirectionalDerivative(values),
        Reply::Terminated => EventData::Terminated,
        Reply::Freed => EventData::Freed,
        Reply::Real { .. } | Reply::States { .. } | Reply::Error(_) => return None,
    })
}

impl Dispatcher {
    pub(crate) fn new(slaves: Vec<SlaveHandle>, wait_timeout: Option<Duration>) -> Self {
        let tracker = Arc::new(PendingRequests::new());
        let proxies = slaves
            .into_iter()
            .enumerate()
            .map(|(index, handle)| SlaveProxy::new(SlaveId(index), handle, tracker.clone()))
            .collect();
        Self {
            proxies,
            tracker,
            listeners: Listeners::default(),
            wait_timeout,
            requests_sent: 0,
            barriers: 0,
        }
    }

    pub fn num_slaves(&self) -> usize {
        self.proxies.len()
    }

    pub fn slaves(&self) -> impl Iterator<Item = SlaveId> {
        (0..self.proxies.len()).map(SlaveId)
    }

    pub fn proxies(&self) -> &[SlaveProxy] {
        &self.proxies
    }

    pub(crate) fn proxies_mut(&mut self) -> &mut [SlaveProxy] {
        &mut self.proxies
    }

    pub fn proxy(&self, slave: SlaveId) -> Result<&SlaveProxy, Error> {
        self.proxies
            .get(slave.0)
            .ok_or_else(|| Error::Config(format!("{slave} is not registered")))
    }

    pub(crate) fn proxy_mut(&mut self, slave: SlaveId) -> Result<&mut SlaveProxy, Error> {
        self.proxies
            .get_mut(slave.0)
            .ok_or_else(|| Error::Config(format!("{slave} is not registered")))
    }

    pub(crate) fn listeners_mut(&mut self) -> &mut Listeners {
        &mut self.listeners
    }

    pub fn num_pending(&self) -> usize {
        self.tracker.count()
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }

    pub fn barriers(&self) -> usize {
        self.barriers
    }

    /// Fire-and-forget dispatch of one command to one slave.
    pub fn send(&mut self, slave: SlaveId, command: Command) -> Result<(), Error> {
        let proxy = self
            .proxies
            .get_mut(slave.0)
            .ok_or_else(|| Error::Config(format!("{slave} is not registered")))?;
        proxy.send(command)?;
        self.requests_sent += 1;
        Ok(())
    }

    pub fn send_many(&mut self, slaves: &[SlaveId], command: &Command) -> Result<(), Error> {
        slaves
            .iter()
            .try_for_each(|slave| self.send(*slave, command.clone()))
    }

    pub fn send_all(&mut self, command: &Command) -> Result<(), Error> {
        (0..self.proxies.len()).try_for_each(|index| self.send(SlaveId(index), command.clone()))
    }

    /// Block until every request dispatched so far has been answered and processed.
    pub fn wait(&mut self) -> Result<(), Error> {
        let started = Instant::now();
        let pending = self.tracker.count();
        let outcome = self.tracker.wait(self.wait_timeout);
        self.barriers += 1;
        log::debug!(
            "Barrier over {pending} request(s): {outcome:?} after {:?}",
            started.elapsed()
        );

        match outcome {
            WaitOutcome::Drained => self.process_completions(),
            WaitOutcome::Faulted => {
                for proxy in &self.proxies {
                    proxy.check_fault()?;
                }
                Err(Error::Transport(
                    "request tracker faulted without a faulty proxy".to_owned(),
                ))
            }
            WaitOutcome::TimedOut { pending } => Err(Error::Timeout {
                pending,
                elapsed: started.elapsed(),
            }),
        }
    }

    pub fn send_wait(&mut self, slave: SlaveId, command: Command) -> Result<(), Error> {
        self.send(slave, command)?;
        self.wait()
    }

    /// Wait for stragglers after a failure, so that no reply of an aborted generation is
    /// mistaken for a reply of the next one. Errors are logged, not returned.
    pub(crate) fn drain(&mut self) {
        if self.num_pending() > 0 {
            log::debug!("Draining {} outstanding request(s)", self.num_pending());
            if let Err(err) = self.wait() {
                log::warn!("Error while draining outstanding requests: {err}");
            }
        }
    }

    /// Fold every received reply into its proxy and notify listeners. All inboxes are emptied
    /// even if a reply carries an error; the first error is returned.
    fn process_completions(&mut self) -> Result<(), Error> {
        let mut first_error = None;
        for proxy in &mut self.proxies {
            for completion in proxy.take_completions() {
                if let Err(err) = proxy.apply(&completion) {
                    log::warn!("{err}");
                    first_error.get_or_insert(err);
                    continue;
                }
                if let Some(data) = event_data(&completion.reply) {
                    self.listeners.dispatch(&SlaveEvent {
                        slave: proxy.id(),
                        name: proxy.name(),
                        data,
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
