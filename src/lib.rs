pub mod cli;
pub mod commits;
pub mod config;
pub mod error;
pub mod hosting;
pub mod ignore;
pub mod loc;
pub mod models;
pub mod pipeline;
pub mod runtime;
pub mod snapshot;
pub mod storage;
pub mod util;

pub use cli::run_cli;
pub use error::{MetricsError, Result};
pub use pipeline::{Pipeline, RefreshOutcome};
