//! Pre-sized buffers reused by every loop-solver residual evaluation.

use crate::{Error, SlaveId};

/// Per-slave continuous-state and event-indicator arrays laid out back to back, plus the loop
/// unknowns and the outputs produced for them.
///
/// Sized once from the slaves' registered counts. The buffers are only reallocated when the
/// layout changes.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IterationStorage {
    counts: Vec<(usize, usize)>,
    state_offsets: Vec<usize>,
    indicator_offsets: Vec<usize>,
    states: Vec<f64>,
    indicators: Vec<f64>,
    unknowns: Vec<f64>,
    outputs: Vec<f64>,
}

fn offsets(counts: impl Iterator<Item = usize>) -> Vec<usize> {
    std::iter::once(0)
        .chain(counts.scan(0, |acc, n| {
            *acc += n;
            Some(*acc)
        }))
        .collect()
}

impl IterationStorage {
    /// Allocate for slaves with the given `(num_continuous_states, num_event_indicators)` and a
    /// loop with `num_unknowns` unknowns.
    pub fn allocate(counts: &[(usize, usize)], num_unknowns: usize) -> Self {
        let mut storage = Self {
            unknowns: vec![0.0; num_unknowns],
            outputs: vec![0.0; num_unknowns],
            ..Default::default()
        };
        storage.ensure_layout(counts);
        storage
    }

    /// Re-lay out the per-slave arrays if `counts` differs from the current layout. Returns
    /// `true` if the buffers were reallocated.
    pub fn ensure_layout(&mut self, counts: &[(usize, usize)]) -> bool {
        if self.counts == counts && !self.state_offsets.is_empty() {
            return false;
        }
        self.counts = counts.to_vec();
        self.state_offsets = offsets(counts.iter().map(|c| c.0));
        self.indicator_offsets = offsets(counts.iter().map(|c| c.1));
        self.states = vec![0.0; self.total_states()];
        self.indicators = vec![0.0; self.total_indicators()];
        true
    }

    pub fn num_slaves(&self) -> usize {
        self.counts.len()
    }

    pub fn total_states(&self) -> usize {
        self.state_offsets.last().copied().unwrap_or(0)
    }

    pub fn total_indicators(&self) -> usize {
        self.indicator_offsets.last().copied().unwrap_or(0)
    }

    pub fn states(&self, slave: usize) -> &[f64] {
        &self.states[self.state_offsets[slave]..self.state_offsets[slave + 1]]
    }

    pub fn indicators(&self, slave: usize) -> &[f64] {
        &self.indicators[self.indicator_offsets[slave]..self.indicator_offsets[slave + 1]]
    }

    /// Copy the states and indicators one slave reported during a residual evaluation.
    ///
    /// Counts that differ from the layout are a protocol error of that slave.
    pub(crate) fn record(
        &mut self,
        slave: SlaveId,
        states: &[f64],
        indicators: &[f64],
    ) -> Result<(), Error> {
        let expected = self.counts.get(slave.0).copied();
        if expected != Some((states.len(), indicators.len())) {
            return Err(Error::Protocol {
                slave,
                reason: format!(
                    "reported {} continuous states and {} event indicators, \
                     buffers hold {expected:?}",
                    states.len(),
                    indicators.len()
                ),
            });
        }
        let index = slave.0;
        self.states[self.state_offsets[index]..self.state_offsets[index + 1]]
            .copy_from_slice(states);
        self.indicators[self.indicator_offsets[index]..self.indicator_offsets[index + 1]]
            .copy_from_slice(indicators);
        Ok(())
    }

    /// The assumed values of the loop unknowns at the last residual evaluation.
    pub fn unknowns(&self) -> &[f64] {
        &self.unknowns
    }

    /// The outputs produced for [`Self::unknowns`].
    pub fn outputs(&self) -> &[f64] {
        &self.outputs
    }

    pub(crate) fn loop_buffers_mut(&mut self) -> (&mut [f64], &mut [f64]) {
        (&mut self.unknowns, &mut self.outputs)
    }
}
