//! Grading core of the judge
//!
//! - `scheduler`: bounded pool of sandbox boxes
//! - `task`: generic request/response binding run on a box
//! - `protocol` / `eval`: the Compile / Execute / Clean contract, local and remote
//! - `checker`: cached custom checkers and their scoring protocols

pub mod artifacts;
pub mod checker;
pub mod config;
pub mod error;
pub mod eval;
pub mod languages;
pub mod protocol;
pub mod sandbox;
pub mod scheduler;
pub mod task;

pub use error::{ErrorKind, EvalError, PrepareError, Result};
pub use eval::{Evaluator, LocalEvaluator};
pub use scheduler::{BoxLease, BoxScheduler, SchedulerConfig};
