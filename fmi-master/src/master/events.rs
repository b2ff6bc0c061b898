//! Per-slave lifecycle notifications.
//!
//! Handlers are registered per [`SlaveEventKind`] and run synchronously on the coordinator's
//! thread while it processes replies. They only see the event, never the coordinator, so they
//! cannot re-enter stepping or change the topology.

use std::collections::HashMap;

use crate::{SlaveId, StateId, ValueRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlaveEventKind {
    Instantiated,
    Initialized,
    Terminated,
    Freed,
    Stepped,
    GotVersion,
    SetReal,
    GotState,
    SetState,
    FreedState,
    DirectionalDerivative,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventData<'a> {
    Instantiated,
    Initialized,
    Terminated,
    Freed,
    /// The slave reached `time`; `vrs`/`values` are the outputs it reported with the step.
    Stepped {
        time: f64,
        vrs: &'a [ValueRef],
        values: &'a [f64],
    },
    GotVersion(&'a str),
    SetReal,
    GotState(StateId),
    SetState,
    FreedState,
    DirectionalDerivative(&'a [f64]),
}

impl EventData<'_> {
    pub fn kind(&self) -> SlaveEventKind {
        match self {
            EventData::Instantiated => SlaveEventKind::Instantiated,
            EventData::Initialized => SlaveEventKind::Initialized,
            EventData::Terminated => SlaveEventKind::Terminated,
            EventData::Freed => SlaveEventKind::Freed,
            EventData::Stepped { .. } => SlaveEventKind::Stepped,
            EventData::GotVersion(_) => SlaveEventKind::GotVersion,
            EventData::SetReal => SlaveEventKind::SetReal,
            EventData::GotState(_) => SlaveEventKind::GotState,
            EventData::SetState => SlaveEventKind::SetState,
            EventData::FreedState => SlaveEventKind::FreedState,
            EventData::DirectionalDerivative(_) => SlaveEventKind::DirectionalDerivative,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlaveEvent<'a> {
    pub slave: SlaveId,
    pub name: &'a str,
    pub data: EventData<'a>,
}

pub type Handler = Box<dyn FnMut(&SlaveEvent<'_>) + Send>;

/// Registered handlers, keyed by event kind. Kinds without handlers cost nothing.
#[derive(Default)]
pub struct Listeners {
    handlers: HashMap<SlaveEventKind, Vec<Handler>>,
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.handlers.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

impl Listeners {
    pub fn on(
        &mut self,
        kind: SlaveEventKind,
        handler: impl FnMut(&SlaveEvent<'_>) + Send + 'static,
    ) {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn num_handlers(&self, kind: SlaveEventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    pub(crate) fn dispatch(&mut self, event: &SlaveEvent<'_>) {
        if let Some(handlers) = self.handlers.get_mut(&event.data.kind()) {
            for handler in handlers {
                handler(event);
            }
        }
    }
}
