//! The `fmi-master` crate implements the coordinating side of a distributed FMI co-simulation.
//!
//! A [`Coordinator`](master::Coordinator) drives a set of independently executing simulation
//! slaves through synchronized communication steps. Each slave is reached through a
//! [`SlaveProxy`] that dispatches [`Command`]s over an opaque [`transport::SlaveTransport`] and
//! counts the replies that are still outstanding. The coordinator exchanges coupling variables
//! along weak connections once per step and resolves strong connections (algebraic loops) with a
//! pluggable [`solver::RootFinder`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use fmi_master::{
//!     master::{Coordinator, Jacobi, MasterOptions},
//!     transport::SlaveHandle,
//!     Connections, SlaveId,
//! };
//! # fn spawn_slaves() -> Vec<SlaveHandle> { vec![] }
//!
//! let handles = spawn_slaves();
//! let connections = Connections::default().weak((SlaveId(0), 1), (SlaveId(1), 0));
//! let mut master = Coordinator::new(
//!     handles,
//!     connections,
//!     Box::new(Jacobi),
//!     MasterOptions::default(),
//! )
//! .unwrap();
//!
//! master.prepare(0.0).unwrap();
//! master.run_iteration(0.0, 0.1).unwrap();
//! master.terminate().unwrap();
//! ```
#![doc = document_features::document_features!()]
#![deny(clippy::all)]

use std::time::Duration;

mod command;
mod connection;
pub mod master;
#[cfg(feature = "me")]
pub mod me;
mod proxy;
pub mod solver;
mod storage;
pub mod traits;
mod tracker;
pub mod transport;

#[cfg(all(test, feature = "local"))]
pub(crate) mod test_slaves;

pub use command::{Command, CommandKind, Reply, Request, RequestId, Response, StateId};
pub use connection::{Connections, Endpoint, StrongConnection, WeakConnection};
pub use proxy::{ResponseHandle, SlaveProxy};
pub use solver::{ConvergenceFailure, FailureReason};
pub use storage::IterationStorage;
pub use traits::{SlaveDescription, VariableDecl};
pub use tracker::PendingRequests;

/// The type of the value reference used to address a variable within one slave.
pub type ValueRef = u32;

/// Index of a slave within its coordinator, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlaveId(pub usize);

impl std::fmt::Display for SlaveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slave#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A reply could not be matched to an outstanding request, or a slave reported data that
    /// contradicts its registration. Fatal to the run.
    #[error("Protocol error on {slave}: {reason}")]
    Protocol { slave: SlaveId, reason: String },

    #[error("{slave} disconnected: {reason}")]
    Disconnected { slave: SlaveId, reason: String },

    #[error("Timed out after {elapsed:?} with {pending} request(s) still pending")]
    Timeout { pending: usize, elapsed: Duration },

    #[error(transparent)]
    Convergence(#[from] ConvergenceFailure),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The slave answered, but with an error status.
    #[error("{slave} reported an error: {message}")]
    Slave { slave: SlaveId, message: String },

    #[error("Operation `{operation}` is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: master::MasterState,
    },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Errors after which the coordinator cannot continue: the reply streams are no longer in a
    /// known state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::Disconnected { .. }
                | Error::Timeout { .. }
                | Error::Transport(_)
        )
    }
}
