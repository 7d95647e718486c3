//! Workspace reconciliation control loop.

pub mod capacity;
pub mod config;
pub mod convergence;
pub mod error;
pub mod reconciler;
pub mod routing;
pub mod signals;
pub mod supervisor;
pub mod suspend;

pub use capacity::{CapacityManager, CapacityPolicy, CapacityReport};
pub use config::Config;
pub use convergence::{plan, Action, ConvergenceEngine, ConvergenceOptions, Outcome, StepResult};
pub use error::{ReconcilerError, Result};
pub use reconciler::{Adapters, CycleReport, Reconciler};
pub use routing::{build_routing_table, RoutingSync};
pub use signals::OperatorSignals;
pub use supervisor::{spawn_supervised, supervise};
pub use suspend::{should_request_suspend, AutoSuspendPolicy};
