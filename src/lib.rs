//! splitrun: a parallel test orchestrator.
//!
//! This crate runs the units of an external test tool in a bounded number of
//! parallel processes, balances the lanes by historical durations, reruns
//! failures while the run is still going and reports what never passed.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Discovery**: List test files and turn them into units
//! - **Units**: Single methods, whole batches and adaptive batches
//! - **Orchestrator**: Phases, partitioning, supervision and reruns
//! - **Provider**: Start the test tool and capture its output
//! - **Report**: Parse result logs and write the failure report
//! - **Statistics**: Remember how long every unit takes
//!
//! # Example
//!
//! ```no_run
//! use splitrun::config::load_config;
//! use splitrun::orchestrator::{Delayer, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("splitrun.toml"))?;
//!     let delayer = Delayer::new(config.splitrun.parallel_delay());
//!     // ... discover units through a UnitFactory sharing `delayer` ...
//!     let result = Orchestrator::new(config, delayer).run(Vec::new()).await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod filter;
pub mod orchestrator;
pub mod provider;
pub mod report;
pub mod statistics;
pub mod unit;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use discovery::{CommandDiscovery, DiscoveredFile, UnitLoader, UnitSource};
pub use orchestrator::{Orchestrator, RunResult};
pub use provider::{ProcessHandle, ProcessLauncher};
pub use report::{FailureReport, ResultLogParser};
pub use statistics::{JsonFileStatistics, StatisticsBackend};
pub use unit::{BoxedUnit, TestUnit, UnitFactory};
