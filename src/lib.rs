//! Execution engine for untrusted code snippets.
//!
//! A [`Scheduler`] validates each submission, runs it on the strongest
//! isolation backend the deployment offers (a disposable Docker container,
//! a bare child process, or an in-process interpreter of last resort) under
//! a wall-clock timeout, and classifies the outcome as an
//! [`ExecutionResult`].
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! let config = execbox::Config::load(None)?;
//! let engine = execbox::Scheduler::initialize(&config).await?;
//! let result = engine.submit("print('hello')").await;
//! println!("{}: {}", result.status, result.stdout);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod probe;
pub mod sandbox;
pub mod scheduler;
pub mod submission;
pub mod validator;

pub use config::Config;
pub use probe::CapabilityFlag;
pub use scheduler::Scheduler;
pub use submission::{ExecutionResult, Status, Submission};
pub use validator::{Validator, Verdict};
