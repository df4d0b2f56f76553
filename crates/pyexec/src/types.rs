//! Foundational public types for the pyexec library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`ExecutorConfig`] — configuration for an [`crate::Executor`] instance
//! - [`ExecutionError`] — structured error variants surfaced as stderr text
//! - [`DEFAULT_ALLOWED_MODULES`] — the default set of permitted stdlib modules

/// The default set of Python standard library modules permitted for import.
///
/// Contains 11 modules commonly needed for data-processing and general scripting
/// while excluding network, filesystem, and subprocess modules that pose security
/// or sandboxing concerns.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "math",
    "re",
    "json",
    "datetime",
    "collections",
    "itertools",
    "functools",
    "string",
    "random",
    "os.path",
    "sys",
];

/// Configuration that governs how an [`crate::Executor`] runs the programs
/// submitted to it over its lifetime.
///
/// Unlike the settings of a one-shot interpreter, this is not re-specified per
/// call: an `Executor` is built once per kernel instance and every `exec_code`
/// call is governed by the same config.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of bytes that may be written to stdout + stderr combined
    /// in a single `exec_code` call. Default: 1,048,576 bytes (1 MiB).
    pub max_output_bytes: usize,

    /// List of Python module names that scripts are permitted to import.
    /// Any `import` statement for a module not in this list raises
    /// [`ExecutionError::ModuleNotAllowed`].
    pub allowed_modules: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 1_048_576,
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Structured error variants produced when Python execution fails.
///
/// These never cross a wire boundary directly — the kernel formats them into
/// the `stderr` side-effect channel using its own conventions.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The Python source could not be parsed.
    SyntaxError {
        /// Human-readable description of the parse error.
        message: String,
        /// 1-based line number of the error, or 0 if unknown.
        line: u32,
        /// 1-based column number of the error, or 0 if unknown.
        col: u32,
    },

    /// A Python exception was raised during execution.
    RuntimeError {
        /// The exception message (e.g. `"division by zero"`).
        message: String,
        /// Python-formatted traceback string, or empty if unavailable.
        traceback: String,
    },

    /// Combined stdout + stderr output exceeded [`ExecutorConfig::max_output_bytes`].
    OutputLimitExceeded {
        /// The output limit that was exceeded, in bytes.
        limit_bytes: usize,
    },

    /// The script attempted to import a module not present in
    /// [`ExecutorConfig::allowed_modules`].
    ModuleNotAllowed {
        /// The exact module name that was denied.
        module_name: String,
    },
}
