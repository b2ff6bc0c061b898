//! Variable exchange along weak connections and residual evaluation for strong ones.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::{
    Command, Endpoint, Error, IterationStorage, SlaveId, StrongConnection, ValueRef,
    WeakConnection,
};

use super::dispatch::Dispatcher;

fn cached(dispatcher: &Dispatcher, endpoint: &Endpoint) -> Result<f64, Error> {
    dispatcher
        .proxy(endpoint.slave)?
        .cached_value(endpoint.vr)
        .ok_or_else(|| Error::Protocol {
            slave: endpoint.slave,
            reason: format!("no value reported for output {}", endpoint.vr),
        })
}

/// Copy producer outputs to consumer inputs for every weak connection, or only for the ones
/// leaving `from`. Producers are read as of the last communication point, so inputs set
/// since then do not change what is propagated. Outputs not known yet are fetched first, with
/// one request per producer; the inputs are then written with one request per consumer.
///
/// Returns the number of set requests sent.
pub(crate) fn propagate_weak(
    dispatcher: &mut Dispatcher,
    weak: &[WeakConnection],
    from: Option<SlaveId>,
) -> Result<usize, Error> {
    let selected = weak
        .iter()
        .filter(|c| from.map_or(true, |slave| c.producer.slave == slave))
        .collect_vec();
    if selected.is_empty() {
        return Ok(0);
    }

    let mut missing: BTreeMap<SlaveId, Vec<ValueRef>> = BTreeMap::new();
    for connection in &selected {
        let producer = &connection.producer;
        if dispatcher.proxy(producer.slave)?.published_value(producer.vr).is_none() {
            missing.entry(producer.slave).or_default().push(producer.vr);
        }
    }
    if !missing.is_empty() {
        for (slave, vrs) in missing {
            let vrs = vrs.into_iter().unique().collect();
            dispatcher.send(slave, Command::GetReal { vrs })?;
        }
        dispatcher.wait()?;
    }

    let mut sets: BTreeMap<SlaveId, (Vec<ValueRef>, Vec<f64>)> = BTreeMap::new();
    for connection in &selected {
        let producer = &connection.producer;
        let value = dispatcher
            .proxy(producer.slave)?
            .published_value(producer.vr)
            .ok_or_else(|| Error::Protocol {
                slave: producer.slave,
                reason: format!("no value reported for output {}", producer.vr),
            })?;
        let (vrs, values) = sets.entry(connection.consumer.slave).or_default();
        vrs.push(connection.consumer.vr);
        values.push(connection.transform(value));
    }

    let num_sets = sets.len();
    for (slave, (vrs, values)) in sets {
        dispatcher.send(slave, Command::SetReal { vrs, values })?;
    }
    dispatcher.wait()?;
    log::trace!("Propagated {} weak connection(s)", selected.len());
    Ok(num_sets)
}

/// The requests of one residual evaluation, grouped per slave once from the loop topology.
#[derive(Debug, Clone, Default)]
pub(crate) struct LoopPlan {
    /// Per consumer: the inputs to write and the indices of the unknowns that feed them.
    sets: Vec<(SlaveId, Vec<ValueRef>, Vec<usize>)>,
    /// Per producer: the outputs to read back.
    gets: Vec<(SlaveId, Vec<ValueRef>)>,
    /// Slaves in the loop with continuous states or event indicators to observe.
    observed: Vec<SlaveId>,
    producers: Vec<Endpoint>,
    consumers: Vec<Endpoint>,
    labels: Vec<String>,
}

impl LoopPlan {
    pub fn new(strong: &[StrongConnection], dispatcher: &Dispatcher) -> Result<Self, Error> {
        let mut sets: BTreeMap<SlaveId, (Vec<ValueRef>, Vec<usize>)> = BTreeMap::new();
        let mut gets: BTreeMap<SlaveId, Vec<ValueRef>> = BTreeMap::new();
        let mut labels = Vec::with_capacity(strong.len());

        for (index, connection) in strong.iter().enumerate() {
            let (vrs, indices) = sets.entry(connection.consumer.slave).or_default();
            vrs.push(connection.consumer.vr);
            indices.push(index);
            gets.entry(connection.producer.slave)
                .or_default()
                .push(connection.producer.vr);

            let consumer = dispatcher.proxy(connection.consumer.slave)?;
            let input = consumer
                .description()
                .input(connection.consumer.vr)
                .map_or_else(|| connection.consumer.vr.to_string(), |v| v.name.clone());
            labels.push(format!("{}.{input}", consumer.name()));
        }

        let mut observed = Vec::new();
        for slave in strong
            .iter()
            .flat_map(|c| [c.producer.slave, c.consumer.slave])
            .unique()
        {
            if dispatcher.proxy(slave)?.reported_state_counts() != (0, 0) {
                observed.push(slave);
            }
        }

        Ok(Self {
            sets: sets
                .into_iter()
                .map(|(slave, (vrs, indices))| (slave, vrs, indices))
                .collect(),
            gets: gets
                .into_iter()
                .map(|(slave, vrs)| (slave, vrs.into_iter().unique().collect()))
                .collect(),
            observed,
            producers: strong.iter().map(|c| c.producer).collect(),
            consumers: strong.iter().map(|c| c.consumer).collect(),
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// `consumer.input` for every unknown, in order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Start values of the consumer inputs, used as the first guess.
    pub fn initial_guess(&self, dispatcher: &Dispatcher) -> Result<Vec<f64>, Error> {
        self.consumers
            .iter()
            .map(|consumer| {
                let start = dispatcher
                    .proxy(consumer.slave)?
                    .description()
                    .input(consumer.vr)
                    .map_or(0.0, |v| v.start);
                Ok(start)
            })
            .collect()
    }

    /// `f(x) = g(x) - x`: write `x` to the consumer inputs, read the producer outputs back as
    /// `g(x)` together with the states and indicators of the loop's slaves. Two barriers per
    /// evaluation regardless of the number of slaves involved.
    pub fn evaluate(
        &self,
        dispatcher: &mut Dispatcher,
        storage: &mut IterationStorage,
        x: &[f64],
        f: &mut [f64],
    ) -> Result<(), Error> {
        for (slave, vrs, indices) in &self.sets {
            let values = indices.iter().map(|&i| x[i]).collect();
            dispatcher.send(
                *slave,
                Command::SetReal {
                    vrs: vrs.clone(),
                    values,
                },
            )?;
        }
        dispatcher.wait()?;

        for (slave, vrs) in &self.gets {
            dispatcher.send(*slave, Command::GetReal { vrs: vrs.clone() })?;
        }
        for slave in &self.observed {
            dispatcher.send(*slave, Command::GetStates)?;
        }
        dispatcher.wait()?;

        for slave in &self.observed {
            let proxy = dispatcher.proxy(*slave)?;
            storage.record(*slave, proxy.states(), proxy.indicators())?;
        }

        let (unknowns, outputs) = storage.loop_buffers_mut();
        unknowns.copy_from_slice(x);
        for (index, producer) in self.producers.iter().enumerate() {
            outputs[index] = cached(dispatcher, producer)?;
            f[index] = outputs[index] - x[index];
        }
        Ok(())
    }

    /// Publish the producers' current outputs once the loop is solved.
    pub fn publish(&self, dispatcher: &mut Dispatcher) -> Result<(), Error> {
        for (slave, vrs) in &self.gets {
            dispatcher.proxy_mut(*slave)?.publish(vrs);
        }
        Ok(())
    }
}
