//! Integration tests for the Executor Facade: exec_code driving a real
//! RustPython VM through the session actor, with callbacks and input
//! round-trips exercised end-to-end.

use std::sync::{Arc, Mutex};

use pyexec::{Executor, ExecutorConfig};

#[derive(Default, Clone)]
struct Capture {
    stdout: Arc<Mutex<Vec<String>>>,
    stderr: Arc<Mutex<Vec<String>>>,
}

impl Capture {
    fn wire(&self, exec: &mut Executor) {
        let stdout = self.stdout.clone();
        exec.on_stdout(move |s| stdout.lock().unwrap().push(s.to_string()));
        let stderr = self.stderr.clone();
        exec.on_stderr(move |s| stderr.lock().unwrap().push(s.to_string()));
    }

    fn stdout(&self) -> String {
        self.stdout.lock().unwrap().concat()
    }

    fn stderr(&self) -> String {
        self.stderr.lock().unwrap().concat()
    }
}

#[test]
fn exec_code_silent_program_emits_no_output() {
    let cap = Capture::default();
    let mut exec = Executor::new(|_| String::new(), 15);
    cap.wire(&mut exec);

    exec.exec_code("i = 2");

    assert_eq!(cap.stdout(), "");
    assert_eq!(cap.stderr(), "");
}

#[test]
fn exec_code_forwards_stdout_writes() {
    let cap = Capture::default();
    let mut exec = Executor::new(|_| String::new(), 15);
    cap.wire(&mut exec);

    exec.exec_code("print(\"hello world\")");

    assert_eq!(cap.stdout(), "hello world\n");
    assert_eq!(cap.stderr(), "");
}

#[test]
fn exec_code_persists_state_across_calls() {
    let cap = Capture::default();
    let mut exec = Executor::new(|_| String::new(), 15);
    cap.wire(&mut exec);

    exec.exec_code("i = 2");
    exec.exec_code("print(i)");

    assert_eq!(cap.stdout(), "2\n");
}

#[test]
fn exec_code_uncaught_exception_emits_traceback_to_stderr() {
    let cap = Capture::default();
    let mut exec = Executor::new(|_| String::new(), 15);
    cap.wire(&mut exec);

    exec.exec_code("raise ValueError('boom')");

    assert!(
        cap.stderr().contains("Traceback"),
        "expected traceback in stderr, got: {:?}",
        cap.stderr()
    );
}

#[test]
fn exec_code_calls_input_fn_and_streams_its_result() {
    let cap = Capture::default();
    let prompts: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let prompts_clone = prompts.clone();
    let mut exec = Executor::new(
        move |prompt| {
            prompts_clone.lock().unwrap().push(prompt.to_string());
            "xyz".to_string()
        },
        15,
    );
    cap.wire(&mut exec);

    exec.exec_code("name = input('Enter something: ')\nprint(name)");

    assert_eq!(prompts.lock().unwrap().as_slice(), ["Enter something: "]);
    assert_eq!(cap.stdout(), "xyz\n");
}

#[test]
fn exec_code_timeout_emits_standardized_message_and_resets_session() {
    let cap = Capture::default();
    let mut exec = Executor::new(|_| String::new(), 1);
    cap.wire(&mut exec);

    exec.exec_code("while True:\n    pass");

    assert_eq!(
        cap.stderr(),
        "Code is executing for too long (>1 secs). Quota over.\n"
    );

    // The abandoned session is discarded; the next call starts fresh rather
    // than hanging behind the stuck loop.
    let cap2 = Capture::default();
    exec.on_stdout({
        let stdout = cap2.stdout.clone();
        move |s| stdout.lock().unwrap().push(s.to_string())
    });
    exec.exec_code("print('back')");
    assert_eq!(cap2.stdout(), "back\n");
}

#[test]
fn exec_code_denies_non_allowlisted_module_import() {
    let cap = Capture::default();
    let config = ExecutorConfig {
        allowed_modules: vec!["math".to_string()],
        ..ExecutorConfig::default()
    };
    let mut exec = Executor::with_config(|_| String::new(), 15, config);
    cap.wire(&mut exec);

    exec.exec_code("import socket");

    assert!(
        cap.stderr().contains("socket"),
        "expected denied-module traceback to mention socket, got: {:?}",
        cap.stderr()
    );
}

#[test]
fn exec_code_matplotlib_show_emits_one_event() {
    let events: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    let mut exec = Executor::new(|_| String::new(), 15);
    exec.on_matplotlib(move |mimetype, content| {
        events_clone
            .lock()
            .unwrap()
            .push((mimetype.to_string(), content.len()));
    });
    exec.exec_code("import matplotlib.pyplot as plt\nplt.plot([1, 2, 3])\nplt.show()");

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "image/png");
    assert!(events[0].1 > 0);
}
