//! Control-loop integration tests against `FakeBroker`. Scenarios that spin
//! up the embedded interpreter are marked `#[ignore]` since VM startup
//! dominates their runtime; run them on demand with `cargo test -- --ignored`.

use std::time::Duration;

use kernel::{Kernel, KernelConfig};
use kernel_broker::{Broker, BrokerError, FakeBroker, RawMessage};
use kernel_proto::{decode, Envelope};
use pyexec::ExecutorConfig;

fn config(kernel_id: &str) -> KernelConfig {
    KernelConfig {
        kernel_id: kernel_id.to_string(),
        session_mode: true,
        ping_interval: Duration::from_millis(50),
        input_timeout: Duration::from_millis(200),
        max_code_execution_time: 5,
        tick_timeout: Duration::from_millis(1),
    }
}

fn push(broker: &mut FakeBroker, queue: &str, envelope: &Envelope) {
    broker.push_inbound(queue, &kernel_proto::encode(envelope).unwrap());
}

#[test]
fn shutdown_exits_cleanly_with_code_zero() {
    let mut broker = FakeBroker::new();
    let cfg = config("k1");
    push(
        &mut broker,
        &cfg.inbox_queue(),
        &Envelope::new("k1", "shutdown", None),
    );

    let kernel = Kernel::new(Box::new(broker), cfg, ExecutorConfig::default());
    assert_eq!(kernel.run(), 0);
}

#[test]
fn ping_request_updates_liveness_and_replies_on_reverse_path() {
    let mut broker = FakeBroker::new();
    let cfg = config("k1");
    push(
        &mut broker,
        &cfg.inbox_queue(),
        &Envelope::new(
            "k1",
            "ping_request",
            Some(serde_json::json!({"reverse_path": "ping-replies"})),
        ),
    );
    push(
        &mut broker,
        &cfg.inbox_queue(),
        &Envelope::new("k1", "shutdown", None),
    );

    // We need to inspect what the kernel published, so wrap the FakeBroker
    // behind a scripted broker that records sent envelopes as it goes.
    let recorder = Recorder::new(broker);
    let handle = recorder.sent.clone();
    let kernel = Kernel::new(Box::new(recorder), config("k1"), ExecutorConfig::default());
    assert_eq!(kernel.run(), 0);

    let sent = handle.borrow();
    let replies: Vec<&Envelope> = sent
        .iter()
        .filter(|e| e.header.msg_type == "ping_response")
        .collect();
    assert_eq!(replies.len(), 1);
}

#[test]
fn envelope_addressed_to_a_different_kernel_id_is_dropped() {
    let mut broker = FakeBroker::new();
    let cfg = config("k1");
    broker.push_inbound(
        &cfg.inbox_queue(),
        &kernel_proto::encode(&Envelope::new(
            "someone-else",
            "ping_request",
            Some(serde_json::json!({"reverse_path": "ping-replies"})),
        ))
        .unwrap(),
    );
    push(&mut broker, &cfg.inbox_queue(), &Envelope::new("k1", "shutdown", None));

    let recorder = Recorder::new(broker);
    let handle = recorder.sent.clone();
    let kernel = Kernel::new(Box::new(recorder), config("k1"), ExecutorConfig::default());
    assert_eq!(kernel.run(), 0);
    assert!(handle.borrow().is_empty());
}

#[test]
fn ping_liveness_timeout_shuts_down_without_explicit_shutdown_message() {
    let broker = FakeBroker::new();
    let cfg = config("k1"); // ping_interval = 50ms, so 2x = 100ms
    let kernel = Kernel::new(Box::new(broker), cfg, ExecutorConfig::default());

    let start = std::time::Instant::now();
    assert_eq!(kernel.run(), 0);
    assert!(start.elapsed() >= Duration::from_millis(90));
}

#[test]
#[ignore]
fn single_shot_mode_exits_after_one_code_execution_without_shutdown() {
    let mut broker = FakeBroker::new();
    let mut cfg = config("k1");
    cfg.session_mode = false;
    push(
        &mut broker,
        &cfg.inbox_queue(),
        &Envelope::new(
            "k1",
            "code_execution",
            Some(serde_json::json!({"reverse_path": "exec-replies", "code": "print('hi')"})),
        ),
    );
    // No shutdown message is queued; single-shot mode must exit on its own
    // once this one execution completes.

    let recorder = Recorder::new(broker);
    let handle = recorder.sent.clone();
    let mut run_cfg = config("k1");
    run_cfg.session_mode = false;
    let kernel = Kernel::new(Box::new(recorder), run_cfg, ExecutorConfig::default());
    assert_eq!(kernel.run(), 0);

    let sent = handle.borrow();
    assert!(sent.iter().any(|e| e.header.msg_type == "code_execution_complete"));
}

#[test]
#[ignore]
fn code_execution_emits_stdout_chunk_then_completion() {
    let mut broker = FakeBroker::new();
    let cfg = config("k1");
    push(
        &mut broker,
        &cfg.inbox_queue(),
        &Envelope::new(
            "k1",
            "code_execution",
            Some(serde_json::json!({"reverse_path": "exec-replies", "code": "print('hi')"})),
        ),
    );
    push(&mut broker, &cfg.inbox_queue(), &Envelope::new("k1", "shutdown", None));

    let recorder = Recorder::new(broker);
    let handle = recorder.sent.clone();
    let kernel = Kernel::new(Box::new(recorder), config("k1"), ExecutorConfig::default());
    assert_eq!(kernel.run(), 0);

    let sent = handle.borrow();
    let stdout_chunks: Vec<&Envelope> = sent.iter().filter(|e| e.header.msg_type == "stdout").collect();
    assert_eq!(stdout_chunks.len(), 1);
    assert_eq!(stdout_chunks[0].msg_data.as_ref().unwrap()["content"], "hi\n");

    // "hi\n" was already published as a complete line above; the completion
    // envelope carries only whatever never finished a line (nothing here),
    // never a repeat of output already sent as a chunk.
    let complete = sent
        .iter()
        .find(|e| e.header.msg_type == "code_execution_complete")
        .expect("completion message");
    assert_eq!(complete.msg_data.as_ref().unwrap()["stdout"], "");
}

#[test]
#[ignore]
fn uncaught_exception_reports_traceback_on_stderr_and_completion() {
    let mut broker = FakeBroker::new();
    let cfg = config("k1");
    push(
        &mut broker,
        &cfg.inbox_queue(),
        &Envelope::new(
            "k1",
            "code_execution",
            Some(serde_json::json!({"reverse_path": "exec-replies", "code": "1 / 0"})),
        ),
    );
    push(&mut broker, &cfg.inbox_queue(), &Envelope::new("k1", "shutdown", None));

    let recorder = Recorder::new(broker);
    let handle = recorder.sent.clone();
    let kernel = Kernel::new(Box::new(recorder), config("k1"), ExecutorConfig::default());
    assert_eq!(kernel.run(), 0);

    let sent = handle.borrow();
    // The traceback is newline-terminated, so it is fully published as
    // stderr chunks as it is written; nothing is left over for the
    // completion envelope to repeat.
    let stderr_chunks: Vec<&Envelope> = sent.iter().filter(|e| e.header.msg_type == "stderr").collect();
    let full_stderr: String = stderr_chunks
        .iter()
        .map(|e| e.msg_data.as_ref().unwrap()["content"].as_str().unwrap())
        .collect();
    assert!(
        full_stderr.contains("ZeroDivisionError"),
        "stderr chunks were: {full_stderr:?}"
    );

    let complete = sent
        .iter()
        .find(|e| e.header.msg_type == "code_execution_complete")
        .expect("completion message");
    assert_eq!(complete.msg_data.as_ref().unwrap()["stderr"], "");
}

// ── test-only broker wrapper ─────────────────────────────────────────────

use std::cell::RefCell;
use std::rc::Rc;

/// Wraps a `FakeBroker` and records every outbound envelope as it is sent,
/// since `Kernel` takes ownership of its `Broker` and tests otherwise have
/// no way to observe what it published.
struct Recorder {
    inner: FakeBroker,
    sent: Rc<RefCell<Vec<Envelope>>>,
}

impl Recorder {
    fn new(inner: FakeBroker) -> Self {
        Self {
            inner,
            sent: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl Broker for Recorder {
    fn get_messages(&mut self, queue: &str, timeout: Duration) -> Result<Vec<RawMessage>, BrokerError> {
        self.inner.get_messages(queue, timeout)
    }

    fn ack(&mut self, system_id: &str) -> Result<(), BrokerError> {
        self.inner.ack(system_id)
    }

    fn send(&mut self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        if let Ok(envelope) = decode(payload) {
            self.sent.borrow_mut().push(envelope);
        }
        self.inner.send(queue, payload)
    }
}
