//! pyexec: embedded Python execution engine, driven by the code-execution kernel.
//!
//! [`Executor`] is the Executor Facade: construct it once per kernel instance with
//! an input callback and a wall-clock ceiling, register the three side-effect
//! channels, then call [`Executor::exec_code`] once per `code_execution` message.
//! The interpreter's global scope persists across calls on the same `Executor`,
//! which is what makes session mode meaningful.

pub mod executor;
pub mod modules;
pub(crate) mod session;
pub mod types;
pub(crate) mod vm;

pub use executor::{maybe_wrap_last_expr, Executor};
pub use types::{ExecutionError, ExecutorConfig, DEFAULT_ALLOWED_MODULES};
