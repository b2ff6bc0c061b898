use std::time::Duration;

use fmi_master::{master::MasterOptions, solver::SolverOptions};

use crate::{options::SimOptions, scenarios::Experiment};

/// Resolved run parameters: command-line options take precedence over the scenario's default
/// experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterParams {
    pub start_time: f64,
    pub stop_time: f64,
    pub step_size: f64,
    pub max_step_halvings: u32,
    pub master: MasterOptions,
}

impl MasterParams {
    pub fn new_from_options(options: &SimOptions, experiment: &Experiment) -> anyhow::Result<Self> {
        let start_time = options.start_time.unwrap_or(experiment.start_time);
        let stop_time = options.stop_time.unwrap_or(experiment.stop_time);
        let step_size = options.step_size.unwrap_or(experiment.step_size);

        if !(stop_time > start_time) {
            anyhow::bail!(
                "`stop_time` ({stop_time}) must be greater than `start_time` ({start_time})."
            );
        }
        if !(step_size > 0.0 && step_size.is_finite()) {
            anyhow::bail!("`step_size` must be positive, got {step_size}.");
        }

        let defaults = SolverOptions::default();
        let solver = SolverOptions {
            tolerance: options.tolerance.unwrap_or(defaults.tolerance),
            max_iterations: options.max_iterations.unwrap_or(defaults.max_iterations),
            ..defaults
        };
        if !(solver.tolerance > 0.0) {
            anyhow::bail!("`tolerance` must be positive, got {}.", solver.tolerance);
        }

        let wait_timeout = match options.wait_timeout_ms {
            None => MasterOptions::default().wait_timeout,
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            start_time,
            stop_time,
            step_size,
            max_step_halvings: options.max_step_halvings,
            master: MasterOptions {
                wait_timeout,
                solver,
                slave_tolerance: options.tolerance,
            },
        })
    }
}
