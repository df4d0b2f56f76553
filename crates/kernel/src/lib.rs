//! Kernel State (§3) and the Control Loop (§4.4): the part of the system
//! that owns a broker connection, validates and dispatches envelopes, and
//! drives a [`pyexec::Executor`] across the lifetime of one kernel process.

pub mod state;

mod loop_;

pub use loop_::{Kernel, KernelConfig};
pub use state::{InProgressTag, KernelState};
