use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use arrow::{
    array::{ArrayRef, Float64Builder},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use fmi_master::{
    master::{Coordinator, EventData, SlaveEventKind},
    SlaveId, ValueRef,
};

type Reported = Arc<Mutex<HashMap<(SlaveId, ValueRef), f64>>>;

/// Records the time and every slave output once per communication step.
///
/// Output values come from the coordinator's cache when it is current, otherwise from the last
/// step completion the slave reported. The policy's force outputs are appended as zero-filled
/// `force_<i>` columns.
pub struct Recorder {
    schema: Schema,
    columns: Vec<(SlaveId, ValueRef)>,
    time: Float64Builder,
    values: Vec<Float64Builder>,
    forces: Vec<Float64Builder>,
    reported: Reported,
}

impl Recorder {
    /// Lay out one column per slave output and subscribe to step completions.
    pub fn attach(master: &mut Coordinator, capacity: usize) -> Self {
        let mut fields = vec![Field::new("time", DataType::Float64, false)];
        let mut columns = Vec::new();
        for proxy in master.proxies() {
            for output in &proxy.description().outputs {
                fields.push(Field::new(
                    format!("{}.{}", proxy.name(), output.name),
                    DataType::Float64,
                    true,
                ));
                columns.push((proxy.id(), output.vr));
            }
        }
        let num_forces = master.get_num_force_outputs();
        fields.extend(
            (0..num_forces).map(|i| Field::new(format!("force_{i}"), DataType::Float64, false)),
        );

        let reported = Reported::default();
        let sink = reported.clone();
        master.on(SlaveEventKind::Stepped, move |event| {
            if let EventData::Stepped { vrs, values, .. } = event.data {
                let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
                for (vr, value) in vrs.iter().zip(values) {
                    sink.insert((event.slave, *vr), *value);
                }
            }
        });

        let builder = || Float64Builder::with_capacity(capacity);
        Self {
            schema: Schema::new(fields),
            time: builder(),
            values: columns.iter().map(|_| builder()).collect(),
            forces: (0..num_forces).map(|_| builder()).collect(),
            columns,
            reported,
        }
    }

    pub fn record(&mut self, master: &Coordinator, time: f64) {
        log::trace!("Recording outputs at t = {time}");
        self.time.append_value(time);

        let reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        for ((slave, vr), builder) in self.columns.iter().zip(&mut self.values) {
            let cached = master.proxy(*slave).ok().and_then(|p| p.cached_value(*vr));
            builder.append_option(cached.or_else(|| reported.get(&(*slave, *vr)).copied()));
        }
        for builder in &mut self.forces {
            builder.append_value(0.0);
        }
    }

    pub fn finish(mut self) -> anyhow::Result<RecordBatch> {
        let columns = std::iter::once(&mut self.time)
            .chain(&mut self.values)
            .chain(&mut self.forces)
            .map(|builder| Arc::new(builder.finish()) as ArrayRef)
            .collect::<Vec<_>>();
        Ok(RecordBatch::try_new(Arc::new(self.schema), columns)?)
    }
}
