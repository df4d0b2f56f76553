//! Persistent interpreter session — a single dedicated-thread actor.
//!
//! One OS thread owns exactly one [`PyInterp`] for as long as the session
//! lives, and the interpreter never crosses the thread boundary (it is not
//! `Send`). Unlike a pool slot, this thread does **not** reset `sys.modules`
//! or scope state between calls — session persistence across `exec_code`
//! calls is the entire point of the design (see [`crate::Executor`]).
//!
//! ## Streaming side effects
//!
//! Every observable side effect of a call — stdout/stderr writes, matplotlib
//! events, `input()` prompts — is pushed as a [`SessionEvent`] onto a bounded
//! channel back to the caller, ending with `Done`. The calling thread (the
//! `Executor`, i.e. the kernel's own thread) drains this channel
//! synchronously, so every kernel-visible callback fires on the kernel's
//! thread even though the Python bytecode itself runs on the session's
//! dedicated thread.
//!
//! ## Abandonment on timeout
//!
//! If the caller stops draining the channel (because it decided the call
//! timed out), the session thread eventually blocks forever on a full
//! channel or a long-running loop. [`Executor`](crate::Executor) handles
//! this by discarding the old `InterpreterSession` and spawning a fresh one
//! on the next call — the old thread, and whatever interpreter state it
//! held, is leaked. This is the one place session persistence does not
//! survive a wall-clock overrun; see DESIGN.md.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use crate::types::ExecutionError;
use crate::vm::{build_interpreter, run_code, PyInterp};

/// One Python source string to execute, plus the channel its side effects
/// and final result are reported through.
pub(crate) struct WorkItem {
    pub wrapped_source: String,
    pub events: SyncSender<SessionEvent>,
}

/// An observable side effect or terminal event of one `exec_code` call.
pub(crate) enum SessionEvent {
    Stdout(String),
    Stderr(String),
    Matplotlib { mimetype: String, content: Vec<u8> },
    /// The program called `input(prompt)`. The session thread blocks on
    /// `reply` until the caller sends back the line to return from `input()`.
    Input {
        prompt: String,
        reply: SyncSender<String>,
    },
    /// Execution finished (normally or with an error). No further events
    /// follow.
    Done,
}

/// Handed to the VM layer so it can report side effects without knowing
/// about channels, mutexes, or the kernel above it.
///
/// Tracks a combined stdout+stderr byte count against `max_output_bytes` as
/// a resource-safety backstop independent of the kernel's own per-stream
/// chunk buffers (which are input-controlled and unbounded by design).
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: SyncSender<SessionEvent>,
    written: Arc<Mutex<usize>>,
    max_output_bytes: usize,
}

impl EventSink {
    fn new(tx: SyncSender<SessionEvent>, max_output_bytes: usize) -> Self {
        Self {
            tx,
            written: Arc::new(Mutex::new(0)),
            max_output_bytes,
        }
    }

    fn charge(&self, len: usize) -> Result<(), usize> {
        let mut written = self.written.lock().expect("EventSink mutex poisoned");
        if *written + len > self.max_output_bytes {
            return Err(self.max_output_bytes);
        }
        *written += len;
        Ok(())
    }

    /// Reports a stdout write. Returns the configured limit if the combined
    /// stdout+stderr byte budget would be exceeded.
    pub(crate) fn stdout(&self, content: &str) -> Result<(), usize> {
        self.charge(content.len())?;
        let _ = self.tx.send(SessionEvent::Stdout(content.to_string()));
        Ok(())
    }

    /// Reports a stderr write. Same limit semantics as [`stdout`](Self::stdout).
    pub(crate) fn stderr(&self, content: &str) -> Result<(), usize> {
        self.charge(content.len())?;
        let _ = self.tx.send(SessionEvent::Stderr(content.to_string()));
        Ok(())
    }

    /// Reports one rendered matplotlib figure. Not subject to the output
    /// byte cap — figures are not accumulated stdout/stderr text.
    pub(crate) fn matplotlib(&self, mimetype: &str, content: Vec<u8>) {
        let _ = self.tx.send(SessionEvent::Matplotlib {
            mimetype: mimetype.to_string(),
            content,
        });
    }

    /// Blocks the calling (session) thread until the kernel thread supplies
    /// a reply for this prompt.
    pub(crate) fn input(&self, prompt: &str) -> String {
        let (reply_tx, reply_rx) = mpsc::sync_channel::<String>(1);
        if self
            .tx
            .send(SessionEvent::Input {
                prompt: prompt.to_string(),
                reply: reply_tx,
            })
            .is_err()
        {
            return String::new();
        }
        reply_rx.recv().unwrap_or_default()
    }
}

/// A handle to a live session thread.
///
/// Dropping this handle closes the work channel, which causes the session
/// thread to exit its loop the next time it would call `recv()`.
pub(crate) struct InterpreterSession {
    tx: SyncSender<WorkItem>,
}

impl InterpreterSession {
    /// Spawns a dedicated thread, builds one [`PyInterp`] on it, and returns
    /// a handle for dispatching work. The interpreter is built synchronously
    /// before this call returns (the spawning thread blocks on a readiness
    /// channel), so the first `dispatch` is guaranteed not to race startup.
    pub(crate) fn spawn(allowed_set: HashSet<String>, max_output_bytes: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<WorkItem>(1);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<()>(1);

        std::thread::Builder::new()
            .name("pyexec-session".to_string())
            .spawn(move || {
                let interp = build_interpreter(allowed_set);
                let _ = ready_tx.send(());
                session_loop(interp, rx, max_output_bytes);
            })
            .expect("failed to spawn pyexec session thread");

        ready_rx
            .recv()
            .expect("pyexec session thread died before becoming ready");

        Self { tx }
    }

    /// Hands a work item to the session thread. Never blocks for long: the
    /// channel has capacity 1 and a fresh session always starts idle.
    pub(crate) fn dispatch(&self, item: WorkItem) {
        let _ = self.tx.send(item);
    }
}

/// Renders a structured [`ExecutionError`] the way it would appear on a
/// real Python stderr, for the session loop to forward through the
/// `stderr` side-effect channel — the only place these errors become
/// externally visible.
fn format_error(error: &ExecutionError) -> String {
    match error {
        ExecutionError::SyntaxError { message, line, col } => {
            format!("  File \"<string>\", line {line}\nSyntaxError: {message} (col {col})\n")
        }
        ExecutionError::RuntimeError { traceback, message } => {
            if traceback.is_empty() {
                format!("{message}\n")
            } else {
                traceback.clone()
            }
        }
        ExecutionError::ModuleNotAllowed { module_name } => {
            format!("ImportError: module '{module_name}' is not allowed\n")
        }
        ExecutionError::OutputLimitExceeded { limit_bytes } => {
            format!("RuntimeError: Output limit exceeded: {limit_bytes} bytes\n")
        }
    }
}

fn session_loop(interp: PyInterp, rx: Receiver<WorkItem>, max_output_bytes: usize) {
    loop {
        let item = match rx.recv() {
            Ok(item) => item,
            Err(_) => return, // Executor dropped — shut down.
        };

        let sink = EventSink::new(item.events.clone(), max_output_bytes);
        let result = run_code(&interp, &item.wrapped_source, &sink);
        match result.error {
            Some(error) => {
                let _ = sink.stderr(&format_error(&error));
            }
            // `maybe_wrap_last_expr` rewrote a bare trailing expression into
            // `__result__ = <expr>`; echo its repr the way a REPL would.
            None => {
                if let Some(repr) = result.return_value {
                    let _ = sink.stdout(&format!("{repr}\n"));
                }
            }
        }
        let _ = item.events.send(SessionEvent::Done);
    }
}
