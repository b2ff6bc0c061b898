//! Run built-in co-simulation scenarios through the `fmi-master` coordinator and collect the
//! slave outputs into an Arrow [`RecordBatch`].
#![doc = document_features::document_features!()]
#![deny(clippy::all)]

use arrow::record_batch::RecordBatch;
use fmi_master::{
    master::{Coordinator, GaussSeidel, Jacobi, MasterStats, SteppingPolicy},
    Error,
};

pub mod options;
pub mod params;
pub mod recorder;
pub mod scenarios;

use options::{Policy, SimOptions};
use params::MasterParams;
use recorder::Recorder;
use scenarios::Topology;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimStats {
    pub end_time: f64,
    pub num_steps: usize,
    /// Steps repeated with a smaller step size after the loop solver gave up.
    pub num_retries: usize,
    pub master: MasterStats,
}

impl From<Policy> for Box<dyn SteppingPolicy> {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Jacobi => Box::new(Jacobi),
            Policy::GaussSeidel => Box::new(GaussSeidel),
        }
    }
}

/// Advance the coupled system by at most `step_size`, halving the step while the loop solver
/// fails. Returns the step actually taken and the number of retries.
///
/// Every attempt is bracketed by a saved state, which is released again whatever the outcome.
pub fn advance_with_retry(
    master: &mut Coordinator,
    time: f64,
    step_size: f64,
    max_halvings: u32,
) -> anyhow::Result<(f64, usize)> {
    let mut step_size = step_size;
    let mut retries = 0;
    loop {
        let snapshot = master.save_states()?;
        match master.run_iteration(time, step_size) {
            Ok(()) => {
                master.free_states(snapshot)?;
                return Ok((step_size, retries));
            }
            Err(Error::Convergence(failure)) if retries < max_halvings as usize => {
                log::warn!("Step at t = {time} with h = {step_size} failed: {failure}, retrying");
                master.restore_states(&snapshot)?;
                master.free_states(snapshot)?;
                step_size /= 2.0;
                retries += 1;
            }
            Err(err) => {
                if let Err(free_err) = master.free_states(snapshot) {
                    log::warn!("Could not release the states saved at t = {time}: {free_err}");
                }
                return Err(err.into());
            }
        }
    }
}

#[cfg(feature = "csv")]
fn write_csv(batch: &RecordBatch, path: &std::path::Path) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    let mut writer = arrow::csv::Writer::new(file);
    writer.write(batch)?;
    Ok(())
}

#[cfg(not(feature = "csv"))]
fn write_csv(_batch: &RecordBatch, _path: &std::path::Path) -> anyhow::Result<()> {
    anyhow::bail!("Writing outputs requires the `csv` feature")
}

pub fn simulate(options: &SimOptions) -> anyhow::Result<(RecordBatch, SimStats)> {
    let params = MasterParams::new_from_options(options, &options.scenario.default_experiment())?;
    log::info!(
        "Simulating {:?} from {} to {} with step {}",
        options.scenario,
        params.start_time,
        params.stop_time,
        params.step_size
    );
    let (batch, stats) = simulate_topology(options.scenario.build(), options.policy, &params)?;

    if let Some(path) = &options.output {
        write_csv(&batch, path)?;
        log::info!("Wrote outputs to {}", path.display());
    }

    Ok((batch, stats))
}

/// Run `topology` from `params.start_time` to `params.stop_time`, recording one row per
/// communication point.
pub fn simulate_topology(
    topology: Topology,
    policy: Policy,
    params: &MasterParams,
) -> anyhow::Result<(RecordBatch, SimStats)> {
    let mut master = Coordinator::new(
        topology.slaves,
        topology.connections,
        policy.into(),
        params.master.clone(),
    )?;

    let capacity = ((params.stop_time - params.start_time) / params.step_size).ceil() as usize + 1;
    let mut recorder = Recorder::attach(&mut master, capacity);

    master.prepare(params.start_time)?;
    recorder.record(&master, params.start_time);

    let mut stats = SimStats::default();
    let mut time = params.start_time;
    let eps = params.step_size * 1e-9;
    while time < params.stop_time - eps {
        let step_size = params.step_size.min(params.stop_time - time);
        let (taken, retries) =
            advance_with_retry(&mut master, time, step_size, params.max_step_halvings)?;
        time += taken;
        stats.num_steps += 1;
        stats.num_retries += retries;
        recorder.record(&master, time);
    }

    stats.end_time = time;
    stats.master = master.stats();
    master.terminate()?;

    let batch = recorder.finish()?;
    log::debug!("Recorded {} row(s)", batch.num_rows());
    Ok((batch, stats))
}
