//! `KernelState`: everything the control loop remembers between polling
//! cycles (§3). Plain data — the loop owns all the transitions.

use std::collections::HashSet;
use std::time::Instant;

/// The two things a kernel can be in the middle of. `InputRequest` implies
/// `CodeExecution` is also in progress (a program blocked on `input()` is
/// still "executing"), but they are tracked separately because the
/// admissible-message-set differs between the two (§4.4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InProgressTag {
    CodeExecution,
    InputRequest,
}

/// Everything the control loop needs across polling cycles for one kernel
/// instance. There is exactly one of these per process.
pub struct KernelState {
    pub kernel_id: String,
    in_progress: HashSet<InProgressTag>,
    pub last_ping_ts: Instant,

    /// Set for the duration of one `code_execution` request: where its
    /// reply is addressed, the id it is replying to, and when it started
    /// (for logging — wall-clock enforcement itself lives in `pyexec`).
    pub exec_reverse_path: Option<String>,
    pub exec_msg_id: Option<String>,
    pub exec_start_time: Option<Instant>,

    /// Full stdout/stderr transcript accumulated since the current
    /// execution began, reported verbatim in `code_execution_complete`.
    pub pending_stdout: String,
    pub pending_stderr: String,

    /// The last `input_response` payload accepted while waiting on an
    /// `input()` call, kept around for diagnostics after the wait resolves.
    pub last_input_response: Option<String>,
}

impl KernelState {
    pub fn new(kernel_id: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            in_progress: HashSet::new(),
            last_ping_ts: Instant::now(),
            exec_reverse_path: None,
            exec_msg_id: None,
            exec_start_time: None,
            pending_stdout: String::new(),
            pending_stderr: String::new(),
            last_input_response: None,
        }
    }

    pub fn mark_in_progress(&mut self, tag: InProgressTag) {
        self.in_progress.insert(tag);
    }

    pub fn mark_not_in_progress(&mut self, tag: InProgressTag) {
        self.in_progress.remove(&tag);
    }

    pub fn is_in_progress(&self, tag: InProgressTag) -> bool {
        self.in_progress.contains(&tag)
    }

    /// Begins tracking a new `code_execution` request.
    pub fn start_execution(&mut self, reverse_path: String, msg_id: String) {
        self.exec_reverse_path = Some(reverse_path);
        self.exec_msg_id = Some(msg_id);
        self.exec_start_time = Some(Instant::now());
        self.pending_stdout.clear();
        self.pending_stderr.clear();
        self.mark_in_progress(InProgressTag::CodeExecution);
    }

    /// Clears all per-execution bookkeeping once a `code_execution_complete`
    /// has been published (or the execution was abandoned).
    pub fn finish_execution(&mut self) -> (String, String) {
        self.mark_not_in_progress(InProgressTag::InputRequest);
        self.mark_not_in_progress(InProgressTag::CodeExecution);
        self.exec_reverse_path = None;
        self.exec_msg_id = None;
        self.exec_start_time = None;
        self.last_input_response = None;
        (
            std::mem::take(&mut self.pending_stdout),
            std::mem::take(&mut self.pending_stderr),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_idle() {
        let state = KernelState::new("k1");
        assert!(!state.is_in_progress(InProgressTag::CodeExecution));
        assert!(!state.is_in_progress(InProgressTag::InputRequest));
    }

    #[test]
    fn start_execution_marks_in_progress_and_resets_buffers() {
        let mut state = KernelState::new("k1");
        state.pending_stdout.push_str("stale");
        state.start_execution("r1".to_string(), "m1".to_string());
        assert!(state.is_in_progress(InProgressTag::CodeExecution));
        assert_eq!(state.exec_reverse_path.as_deref(), Some("r1"));
        assert_eq!(state.pending_stdout, "");
    }

    #[test]
    fn finish_execution_drains_buffers_and_clears_flags() {
        let mut state = KernelState::new("k1");
        state.start_execution("r1".to_string(), "m1".to_string());
        state.mark_in_progress(InProgressTag::InputRequest);
        state.pending_stdout.push_str("hello");
        state.pending_stderr.push_str("oops");

        let (stdout, stderr) = state.finish_execution();
        assert_eq!(stdout, "hello");
        assert_eq!(stderr, "oops");
        assert!(!state.is_in_progress(InProgressTag::CodeExecution));
        assert!(!state.is_in_progress(InProgressTag::InputRequest));
        assert_eq!(state.exec_reverse_path, None);
    }
}
