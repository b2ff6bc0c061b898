use clap::{Parser, ValueEnum};

/// Built-in coupled systems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Two feedthrough slaves forming an algebraic loop through strong connections
    #[default]
    AlgebraicLoop,
    /// A source driving two integrators in a chain of weak connections
    WeakChain,
    /// Two Model Exchange mass-spring oscillators coupled weakly through their positions
    Oscillator,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    /// All slaves step concurrently
    #[default]
    Jacobi,
    /// Slaves step one after the other, seeing the fresh outputs of earlier slaves
    GaussSeidel,
}

/// Run a built-in scenario through the co-simulation master
#[derive(Debug, Default, Parser)]
#[command(name = "fmi-master-sim", version, about)]
pub struct SimOptions {
    /// The scenario to simulate
    #[arg(value_enum)]
    pub scenario: Scenario,

    /// Start time of the simulation
    #[arg(long)]
    pub start_time: Option<f64>,

    /// Stop time of the simulation
    #[arg(long)]
    pub stop_time: Option<f64>,

    /// Communication step size
    #[arg(long)]
    pub step_size: Option<f64>,

    /// Residual tolerance of the algebraic-loop solver
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Iteration bound of the algebraic-loop solver
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Upper bound on a single barrier, in milliseconds. 0 waits indefinitely
    #[arg(long)]
    pub wait_timeout_ms: Option<u64>,

    /// Order in which slaves advance within a step
    #[arg(long, value_enum, default_value_t = Policy::Jacobi)]
    pub policy: Policy,

    /// How often a step whose loop does not converge is retried with half the step size
    #[arg(long, default_value_t = 4)]
    pub max_step_halvings: u32,

    /// Write the recorded outputs to this CSV file
    #[arg(long)]
    pub output: Option<std::path::PathBuf>,
}
