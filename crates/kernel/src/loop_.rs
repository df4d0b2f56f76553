//! The control loop: polls the broker, validates and dispatches envelopes,
//! drives the [`pyexec::Executor`], and publishes side effects back out.
//!
//! Everything the loop touches between cycles — the broker handle and
//! [`KernelState`] — lives behind one `Rc<RefCell<Shared>>` so that the
//! `input()` callback registered on the `Executor` (which fires from deep
//! inside a blocking `exec_code` call) can poll the broker for an
//! `input_response` the same way the top-level loop polls for everything
//! else, without the `Executor` itself needing a handle back onto the
//! `Kernel` that owns it.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use kernel_broker::Broker;
use kernel_proto::{
    decode, encode, extract, CodeExecution, CodeExecutionComplete, Envelope, InputRequestPrompt,
    InputResponse, MatplotlibDrawing, OutputChunk, PingRequest, PingResponse,
};
use pyexec::{Executor, ExecutorConfig};

use crate::state::{InProgressTag, KernelState};

/// Startup configuration, fixed for the life of the process.
pub struct KernelConfig {
    pub kernel_id: String,
    /// When `false` (the default), the kernel resets the interpreter after
    /// each `code_execution` and exits the process once that execution
    /// completes. When `true`, it keeps global scope across calls and stays
    /// alive serving the top-level loop.
    pub session_mode: bool,
    pub ping_interval: Duration,
    pub input_timeout: Duration,
    pub max_code_execution_time: u64,
    /// How long one `get_messages` poll blocks before returning empty. Paces
    /// how often the loop re-checks ping liveness and input timeouts.
    pub tick_timeout: Duration,
}

impl KernelConfig {
    pub fn inbox_queue(&self) -> String {
        format!("kernel:{}", self.kernel_id)
    }
}

/// Broker + state + config, shared between the top-level loop and the
/// `input()` callback via `Rc<RefCell<_>>`. Never sent across threads.
pub struct Shared {
    broker: Box<dyn Broker>,
    pub state: KernelState,
    config: KernelConfig,
}

impl Shared {
    pub fn new(broker: Box<dyn Broker>, config: KernelConfig) -> Self {
        let state = KernelState::new(config.kernel_id.clone());
        Self {
            broker,
            state,
            config,
        }
    }

    fn send(&mut self, queue: &str, msg_type: &str, payload: serde_json::Value) {
        let envelope = Envelope::new(&self.config.kernel_id, msg_type, Some(payload));
        match encode(&envelope) {
            Ok(wire) => {
                if let Err(e) = self.broker.send(queue, &wire) {
                    warn!("failed to publish {msg_type} to {queue}: {e}");
                }
            }
            Err(e) => warn!("failed to encode outbound {msg_type}: {e}"),
        }
    }
}

/// What happened on one polling cycle, for the caller (either the top-level
/// loop or the `input()` wait) to act on.
enum CycleOutcome {
    Continue,
    Shutdown,
    CodeExecutionRequested(CodeExecution),
    InputReceived(String),
}

const TOP_LEVEL_TYPES: &[&str] = &["ping_request", "code_execution", "input_response", "shutdown"];
const INPUT_WAIT_TYPES: &[&str] = &["ping_request", "input_response", "shutdown"];

/// One fetch-validate-dispatch cycle (§4.4.2). `admissible` restricts which
/// non-ping message types are acted on; everything else is logged and
/// dropped, exactly as an envelope that fails to decode is.
fn poll_cycle(shared: &Rc<RefCell<Shared>>, admissible: &[&str]) -> CycleOutcome {
    let (queue, tick_timeout) = {
        let s = shared.borrow();
        (s.config.inbox_queue(), s.config.tick_timeout)
    };

    let raw = match shared.borrow_mut().broker.get_messages(&queue, tick_timeout) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("broker fetch failed, shutting down: {e}");
            return CycleOutcome::Shutdown;
        }
    };

    let mut envelopes = Vec::with_capacity(raw.len());
    for msg in raw {
        if let Err(e) = shared.borrow_mut().broker.ack(&msg.system_id) {
            warn!("failed to ack message {}: {e}", msg.system_id);
        }
        match decode(&msg.payload) {
            Ok(envelope) => {
                let kernel_id = shared.borrow().config.kernel_id.clone();
                if envelope.header.kernel_id == kernel_id {
                    envelopes.push(envelope);
                } else {
                    debug!("dropping envelope addressed to another kernel_id");
                }
            }
            Err(e) => warn!("dropping unparseable envelope: {e}"),
        }
    }

    // Pings are processed before anything else so a burst of messages never
    // starves liveness tracking (§4.4.3).
    envelopes.sort_by_key(|e| if e.header.msg_type == "ping_request" { 0 } else { 1 });

    let mut outcome = CycleOutcome::Continue;
    for envelope in envelopes {
        match envelope.header.msg_type.as_str() {
            "ping_request" => handle_ping_request(shared, &envelope),
            // A code_execution or input_response landing in the same batch as
            // a shutdown still gets to run; the shutdown's effect is simply
            // to stop the loop once that work (and any of its own polling)
            // is done, not to pre-empt it.
            "shutdown" if matches!(outcome, CycleOutcome::Continue) => {
                info!("shutdown requested");
                outcome = CycleOutcome::Shutdown;
            }
            "shutdown" => info!("shutdown requested; deferred behind pending work this cycle"),
            "code_execution" if admissible.contains(&"code_execution") => {
                if let Some(next) = handle_code_execution_request(shared, &envelope) {
                    outcome = next;
                }
            }
            "input_response" if admissible.contains(&"input_response") => {
                if let Some(next) = handle_input_response(shared, &envelope) {
                    outcome = next;
                }
            }
            other => debug!("dropping inadmissible message type {other} for this mode"),
        }
    }

    if matches!(outcome, CycleOutcome::Continue) {
        let elapsed = shared.borrow().state.last_ping_ts.elapsed();
        let deadline = shared.borrow().config.ping_interval * 2;
        if elapsed > deadline {
            warn!("no ping within {deadline:?} (last at {elapsed:?} ago); shutting down");
            outcome = CycleOutcome::Shutdown;
        }
    }

    outcome
}

fn handle_ping_request(shared: &Rc<RefCell<Shared>>, envelope: &Envelope) {
    let Some(payload) = extract::<PingRequest>(&envelope.msg_data) else {
        warn!("malformed ping_request, dropping");
        return;
    };
    let mut s = shared.borrow_mut();
    s.state.last_ping_ts = Instant::now();
    s.send(
        &payload.reverse_path,
        "ping_response",
        serde_json::to_value(PingResponse {
            in_response_to: envelope.header.msg_id.clone(),
        })
        .expect("PingResponse always serializes"),
    );
}

fn handle_code_execution_request(
    shared: &Rc<RefCell<Shared>>,
    envelope: &Envelope,
) -> Option<CycleOutcome> {
    let payload = extract::<CodeExecution>(&envelope.msg_data)?;
    let mut s = shared.borrow_mut();
    if s.state.is_in_progress(InProgressTag::CodeExecution) {
        warn!("dropping code_execution received while already executing");
        return None;
    }
    s.state
        .start_execution(payload.reverse_path.clone(), envelope.header.msg_id.clone());
    Some(CycleOutcome::CodeExecutionRequested(payload))
}

fn handle_input_response(shared: &Rc<RefCell<Shared>>, envelope: &Envelope) -> Option<CycleOutcome> {
    let mut s = shared.borrow_mut();
    if !s.state.is_in_progress(InProgressTag::InputRequest) {
        debug!("dropping input_response received while not awaiting input");
        return None;
    }
    let payload = extract::<InputResponse>(&envelope.msg_data)?;
    s.state.last_input_response = Some(payload.content.clone());
    s.state.mark_not_in_progress(InProgressTag::InputRequest);
    Some(CycleOutcome::InputReceived(payload.content))
}

/// Splits newly-written output on line boundaries and publishes each
/// complete line immediately (§4.4.8), draining each published line out of
/// `KernelState`'s buffer as it goes. A trailing partial line (no `\n` yet)
/// is left in the buffer — untransmitted — until the next write completes
/// it, or until the execution ends, at which point it is exactly the
/// residual `finish_execution` hands to the completion envelope. It is
/// never sent here as a chunk: §5 requires the residual to appear only in
/// `code_execution_complete`, never as a preceding `stdout`/`stderr` chunk.
fn publish_stdout_lines(shared: &Rc<RefCell<Shared>>) {
    publish_lines(shared, true);
}

fn publish_stderr_lines(shared: &Rc<RefCell<Shared>>) {
    publish_lines(shared, false);
}

fn publish_lines(shared: &Rc<RefCell<Shared>>, is_stdout: bool) {
    loop {
        let (chunk, reverse_path, msg_id) = {
            let mut s = shared.borrow_mut();
            let reverse_path = s.state.exec_reverse_path.clone();
            let msg_id = s.state.exec_msg_id.clone();
            let buf = if is_stdout {
                &mut s.state.pending_stdout
            } else {
                &mut s.state.pending_stderr
            };
            let Some(idx) = buf.find('\n') else { return };
            let chunk = buf.drain(..=idx).collect::<String>();
            (chunk, reverse_path, msg_id)
        };
        let Some(reverse_path) = reverse_path else { return };
        let msg_id = msg_id.unwrap_or_default();
        let msg_type = if is_stdout { "stdout" } else { "stderr" };
        shared.borrow_mut().send(
            &reverse_path,
            msg_type,
            serde_json::to_value(OutputChunk {
                in_response_to: msg_id,
                content: chunk,
            })
            .expect("OutputChunk always serializes"),
        );
    }
}

/// Blocks (re-entering the control loop in input-wait mode) until an
/// `input_response` arrives, `input_timeout` elapses, or a `shutdown`
/// arrives. Registered as the `Executor`'s `input()` callback.
fn fetch_input(shared: &Rc<RefCell<Shared>>, prompt: &str) -> String {
    {
        let mut s = shared.borrow_mut();
        s.state.mark_in_progress(InProgressTag::InputRequest);
        let reverse_path = s.state.exec_reverse_path.clone().unwrap_or_default();
        let msg_id = s.state.exec_msg_id.clone().unwrap_or_default();
        s.send(
            &reverse_path,
            "input_request",
            serde_json::to_value(InputRequestPrompt {
                in_response_to: msg_id,
                prompt: prompt.to_string(),
            })
            .expect("InputRequestPrompt always serializes"),
        );
    }

    let deadline = Instant::now() + shared.borrow().config.input_timeout;
    loop {
        if Instant::now() >= deadline {
            warn!("input_timeout elapsed waiting for input_response; returning empty line");
            shared
                .borrow_mut()
                .state
                .mark_not_in_progress(InProgressTag::InputRequest);
            return String::new();
        }
        match poll_cycle(shared, INPUT_WAIT_TYPES) {
            CycleOutcome::Continue => continue,
            CycleOutcome::InputReceived(content) => return content,
            CycleOutcome::Shutdown => {
                info!("shutdown received while awaiting input");
                std::process::exit(0);
            }
            CycleOutcome::CodeExecutionRequested(_) => unreachable!("not admissible in input-wait mode"),
        }
    }
}

/// The kernel: the long-lived process loop over one broker connection.
pub struct Kernel {
    shared: Rc<RefCell<Shared>>,
    executor: Executor,
    session_mode: bool,
}

impl Kernel {
    /// Builds a `Kernel`. `config.max_code_execution_time <= 2 *
    /// config.ping_interval` is validated by the CLI layer before this is
    /// called (§6.4); this constructor trusts its caller.
    pub fn new(broker: Box<dyn Broker>, config: KernelConfig, module_config: ExecutorConfig) -> Self {
        let max_wall_seconds = config.max_code_execution_time;
        let session_mode = config.session_mode;
        let shared = Rc::new(RefCell::new(Shared::new(broker, config)));

        let input_shared = Rc::clone(&shared);
        let mut executor = Executor::with_config(
            move |prompt| fetch_input(&input_shared, prompt),
            max_wall_seconds,
            module_config,
        );

        let stdout_shared = Rc::clone(&shared);
        executor.on_stdout(move |chunk| {
            stdout_shared.borrow_mut().state.pending_stdout.push_str(chunk);
            publish_stdout_lines(&stdout_shared);
        });

        let stderr_shared = Rc::clone(&shared);
        executor.on_stderr(move |chunk| {
            stderr_shared.borrow_mut().state.pending_stderr.push_str(chunk);
            publish_stderr_lines(&stderr_shared);
        });

        let matplotlib_shared = Rc::clone(&shared);
        executor.on_matplotlib(move |mimetype, content| {
            let mut s = matplotlib_shared.borrow_mut();
            let reverse_path = s.state.exec_reverse_path.clone().unwrap_or_default();
            let msg_id = s.state.exec_msg_id.clone().unwrap_or_default();
            s.send(
                &reverse_path,
                "matplotlib_drawing",
                serde_json::to_value(MatplotlibDrawing::from_bytes(msg_id, mimetype, &content))
                    .expect("MatplotlibDrawing always serializes"),
            );
        });

        Self {
            shared,
            executor,
            session_mode,
        }
    }

    /// Runs one `code_execution` request to completion and publishes its
    /// `code_execution_complete`.
    fn run_code_execution(&mut self, payload: CodeExecution) {
        self.executor.exec_code(&payload.code);
        if !self.session_mode {
            self.executor.reset_session();
        }

        let mut s = self.shared.borrow_mut();
        let reverse_path = s.state.exec_reverse_path.clone().unwrap_or(payload.reverse_path);
        let in_response_to = s.state.exec_msg_id.clone().unwrap_or_default();
        // Whatever is left in these buffers is exactly the residual that
        // never completed a line — everything else was already published
        // as a stdout/stderr chunk by publish_lines as it was written.
        let (stdout, stderr) = s.state.finish_execution();
        s.send(
            &reverse_path,
            "code_execution_complete",
            serde_json::to_value(CodeExecutionComplete {
                in_response_to,
                stdout,
                stderr,
            })
            .expect("CodeExecutionComplete always serializes"),
        );
    }

    /// Runs the top-level control loop until a `shutdown` message arrives,
    /// ping liveness lapses, the broker fails fatally, or (single-shot mode
    /// only) one `code_execution` completes. Returns the process exit code
    /// (§6.5): always `0` — every exit path here is a clean shutdown from
    /// this loop's point of view.
    pub fn run(mut self) -> i32 {
        loop {
            match poll_cycle(&self.shared, TOP_LEVEL_TYPES) {
                CycleOutcome::Continue => continue,
                CycleOutcome::Shutdown => return 0,
                CycleOutcome::CodeExecutionRequested(payload) => {
                    self.run_code_execution(payload);
                    if !self.session_mode {
                        return 0;
                    }
                }
                CycleOutcome::InputReceived(_) => {
                    debug!("stray input_response with no pending input wait; ignoring")
                }
            }
        }
    }
}
