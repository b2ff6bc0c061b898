//! Directed links from a producing slave's output to a consuming slave's input.

use std::collections::BTreeSet;

use crate::{Error, SlaveDescription, SlaveId, ValueRef};

/// One variable of one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub slave: SlaveId,
    pub vr: ValueRef,
}

impl From<(SlaveId, ValueRef)> for Endpoint {
    fn from((slave, vr): (SlaveId, ValueRef)) -> Self {
        Self { slave, vr }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.slave, self.vr)
    }
}

/// Copied once per macro-step, never iterated. The consumer sees
/// `slope * producer + intercept`, lagging by at most one step.
#[derive(Debug, Clone, PartialEq)]
pub struct WeakConnection {
    pub producer: Endpoint,
    pub consumer: Endpoint,
    pub slope: f64,
    pub intercept: f64,
}

impl WeakConnection {
    pub fn new(producer: impl Into<Endpoint>, consumer: impl Into<Endpoint>) -> Self {
        Self {
            producer: producer.into(),
            consumer: consumer.into(),
            slope: 1.0,
            intercept: 0.0,
        }
    }

    pub fn with_transform(mut self, slope: f64, intercept: f64) -> Self {
        self.slope = slope;
        self.intercept = intercept;
        self
    }

    pub fn transform(&self, value: f64) -> f64 {
        self.slope * value + self.intercept
    }
}

/// Part of an algebraic loop: the consumer input must equal the producer output within a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StrongConnection {
    pub producer: Endpoint,
    pub consumer: Endpoint,
}

impl StrongConnection {
    pub fn new(producer: impl Into<Endpoint>, consumer: impl Into<Endpoint>) -> Self {
        Self {
            producer: producer.into(),
            consumer: consumer.into(),
        }
    }
}

/// The fixed coupling topology of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Connections {
    weak: Vec<WeakConnection>,
    strong: Vec<StrongConnection>,
}

impl Connections {
    pub fn weak(mut self, producer: impl Into<Endpoint>, consumer: impl Into<Endpoint>) -> Self {
        self.weak.push(WeakConnection::new(producer, consumer));
        self
    }

    pub fn strong(mut self, producer: impl Into<Endpoint>, consumer: impl Into<Endpoint>) -> Self {
        self.strong.push(StrongConnection::new(producer, consumer));
        self
    }

    pub fn push_weak(&mut self, connection: WeakConnection) {
        self.weak.push(connection);
    }

    pub fn push_strong(&mut self, connection: StrongConnection) {
        self.strong.push(connection);
    }

    pub fn weak_connections(&self) -> &[WeakConnection] {
        &self.weak
    }

    pub fn strong_connections(&self) -> &[StrongConnection] {
        &self.strong
    }

    /// Check every endpoint against the registered slaves.
    pub(crate) fn validate(&self, slaves: &[&SlaveDescription]) -> Result<(), Error> {
        let endpoints = self
            .weak
            .iter()
            .map(|c| (c.producer, c.consumer))
            .chain(self.strong.iter().map(|c| (c.producer, c.consumer)));

        let mut fed = BTreeSet::new();
        for (producer, consumer) in endpoints {
            let from = slaves.get(producer.slave.0).ok_or_else(|| {
                Error::Config(format!("connection from unregistered {}", producer.slave))
            })?;
            let to = slaves.get(consumer.slave.0).ok_or_else(|| {
                Error::Config(format!("connection to unregistered {}", consumer.slave))
            })?;

            if from.output(producer.vr).is_none() {
                return Err(Error::Config(format!(
                    "{producer} is not an output of `{}`",
                    from.name
                )));
            }
            if to.input(consumer.vr).is_none() {
                return Err(Error::Config(format!(
                    "{consumer} is not an input of `{}`",
                    to.name
                )));
            }
            if !fed.insert(consumer) {
                return Err(Error::Config(format!(
                    "{consumer} is fed by more than one connection"
                )));
            }
        }
        Ok(())
    }
}
