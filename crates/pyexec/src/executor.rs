//! The Executor Facade: the kernel's one handle onto the embedded Python VM.
//!
//! [`Executor`] is constructed once per kernel instance with an input
//! callback and a wall-clock ceiling, configured with three side-effect
//! callbacks, then driven with [`Executor::exec_code`] once per
//! `code_execution` message. The underlying [`InterpreterSession`] persists
//! across calls, which is what makes session mode meaningful.

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use log::warn;

use crate::modules::build_allowed_set;
use crate::session::{InterpreterSession, SessionEvent, WorkItem};
use crate::types::ExecutorConfig;

/// The text emitted on `stderr` when a program overruns its wall-clock
/// budget, exactly as specified.
fn timeout_message(max_wall_seconds: u64) -> String {
    format!("Code is executing for too long (>{max_wall_seconds} secs). Quota over.\n")
}

/// Constructed once per kernel instance. Owns the (possibly absent)
/// persistent [`InterpreterSession`] and the three side-effect callbacks the
/// kernel registers at construction time.
pub struct Executor {
    config: ExecutorConfig,
    max_wall_seconds: u64,
    input_fn: Box<dyn FnMut(&str) -> String>,
    on_stdout: Option<Box<dyn FnMut(&str)>>,
    on_stderr: Option<Box<dyn FnMut(&str)>>,
    on_matplotlib: Option<Box<dyn FnMut(&str, Vec<u8>)>>,
    session: Option<InterpreterSession>,
}

impl Executor {
    /// Builds an `Executor` with default [`ExecutorConfig`] (the default
    /// module allowlist, 1 MiB combined output cap).
    pub fn new(
        input_fn: impl FnMut(&str) -> String + 'static,
        max_wall_seconds: u64,
    ) -> Self {
        Self::with_config(input_fn, max_wall_seconds, ExecutorConfig::default())
    }

    /// Builds an `Executor` with an explicit [`ExecutorConfig`] (used by the
    /// kernel CLI's `--allowed-modules` override).
    pub fn with_config(
        input_fn: impl FnMut(&str) -> String + 'static,
        max_wall_seconds: u64,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            config,
            max_wall_seconds,
            input_fn: Box::new(input_fn),
            on_stdout: None,
            on_stderr: None,
            on_matplotlib: None,
            session: None,
        }
    }

    /// Registers the `stdout` side-effect callback.
    pub fn on_stdout(&mut self, f: impl FnMut(&str) + 'static) {
        self.on_stdout = Some(Box::new(f));
    }

    /// Registers the `stderr` side-effect callback. Also receives formatted
    /// tracebacks for uncaught exceptions and the timeout notice.
    pub fn on_stderr(&mut self, f: impl FnMut(&str) + 'static) {
        self.on_stderr = Some(Box::new(f));
    }

    /// Registers the `matplotlib` side-effect callback, `(mimetype, content)`.
    pub fn on_matplotlib(&mut self, f: impl FnMut(&str, Vec<u8>) + 'static) {
        self.on_matplotlib = Some(Box::new(f));
    }

    /// Discards the current persistent session, if any. The next `exec_code`
    /// call starts a fresh interpreter with empty global scope. Used to
    /// honor `--session-mode=false`, where each `code_execution` is meant to
    /// run in isolation rather than share state with the next one.
    pub fn reset_session(&mut self) {
        self.session = None;
    }

    /// Runs one program to completion, blocking the caller for its whole
    /// duration.
    ///
    /// Side effects are streamed through the registered callbacks as they
    /// occur. `input()` calls inside the program synchronously invoke the
    /// configured `input_fn` on this thread. On wall-clock overrun, emits
    /// exactly one standardized `stderr` event and discards the underlying
    /// session so the next call starts a fresh interpreter (see
    /// `session.rs`'s module docs and DESIGN.md).
    pub fn exec_code(&mut self, source: &str) {
        let wrapped = maybe_wrap_last_expr(source);

        if self.session.is_none() {
            self.session = Some(InterpreterSession::spawn(
                build_allowed_set(&self.config),
                self.config.max_output_bytes,
            ));
        }
        let session = self.session.as_ref().expect("session just initialized");

        let (events_tx, events_rx) = std::sync::mpsc::sync_channel::<SessionEvent>(64);
        session.dispatch(WorkItem {
            wrapped_source: wrapped,
            events: events_tx,
        });

        let deadline = Instant::now() + Duration::from_secs(self.max_wall_seconds);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events_rx.recv_timeout(remaining) {
                Ok(SessionEvent::Stdout(content)) => {
                    if let Some(cb) = self.on_stdout.as_mut() {
                        cb(&content);
                    }
                }
                Ok(SessionEvent::Stderr(content)) => {
                    if let Some(cb) = self.on_stderr.as_mut() {
                        cb(&content);
                    }
                }
                Ok(SessionEvent::Matplotlib { mimetype, content }) => {
                    if let Some(cb) = self.on_matplotlib.as_mut() {
                        cb(&mimetype, content);
                    }
                }
                Ok(SessionEvent::Input { prompt, reply }) => {
                    let line = (self.input_fn)(&prompt);
                    let _ = reply.send(line);
                }
                Ok(SessionEvent::Done) => return,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "execution exceeded {}s wall clock; abandoning session",
                        self.max_wall_seconds
                    );
                    if let Some(cb) = self.on_stderr.as_mut() {
                        cb(&timeout_message(self.max_wall_seconds));
                    }
                    // Leak the old session thread (it may be stuck in a
                    // tight loop) and drop our handle so the next call
                    // spawns a fresh interpreter.
                    self.session = None;
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("session thread disconnected mid-execution");
                    self.session = None;
                    return;
                }
            }
        }
    }
}

// ── Source-level expression wrapper ──────────────────────────────────────────

/// Heuristically wrap the last line of `code` as `__result__ = <expr>` if
/// the last line looks like a bare value-producing expression rather than a
/// statement or a side-effecting call.
///
/// The last non-empty line is **left unchanged** when:
/// - The code is empty or all whitespace/blank lines.
/// - The last non-empty line is indented (inside a block).
/// - The last non-empty line starts with a statement keyword (`def`,
///   `class`, `if`, `for`, `import`, `return`, ... or `#`).
/// - The last non-empty line contains a bare assignment (`=`, `+=`, ...).
/// - The last non-empty line looks like a function/method call.
///
/// Otherwise the line is wrapped as `__result__ = <line>`.
pub fn maybe_wrap_last_expr(code: &str) -> String {
    const STATEMENT_PREFIXES: &[&str] = &[
        "def ", "class ", "if ", "elif ", "else:", "else :", "for ", "while ", "try:", "try :",
        "except", "finally:", "finally :", "with ", "import ", "from ", "return ", "return\n",
        "return\r", "pass", "break", "continue", "raise ", "raise\n", "raise\r", "assert ",
        "del ", "global ", "nonlocal ", "yield ", "yield\n", "yield\r", "async ", "await ",
        "match ", "case ", "@", "#",
    ];
    const BARE_KEYWORDS: &[&str] = &[
        "pass", "break", "continue", "return", "yield", "raise", "else:", "finally:", "try:",
    ];

    let lines: Vec<&str> = code.split('\n').collect();
    let last_idx = match lines
        .iter()
        .enumerate()
        .rev()
        .find(|(_, l)| !l.trim().is_empty())
        .map(|(i, _)| i)
    {
        Some(i) => i,
        None => return code.to_string(),
    };

    let original_last_line = lines[last_idx];
    let last_line = original_last_line.trim();

    let leading = original_last_line.len() - original_last_line.trim_start().len();
    if leading > 0 {
        return code.to_string();
    }

    for kw in BARE_KEYWORDS {
        if last_line == *kw {
            return code.to_string();
        }
    }
    for prefix in STATEMENT_PREFIXES {
        if last_line.starts_with(prefix) {
            return code.to_string();
        }
    }
    if looks_like_assignment(last_line) {
        return code.to_string();
    }
    if is_call_statement(last_line) {
        return code.to_string();
    }

    let formatted = format!("__result__ = {last_line}");
    let mut new_lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    new_lines[last_idx] = formatted;
    new_lines.join("\n")
}

fn looks_like_assignment(line: &str) -> bool {
    let chars: Vec<char> = line.chars().collect();
    let n = chars.len();
    for i in 0..n {
        if chars[i] != '=' {
            continue;
        }
        if i + 1 < n && chars[i + 1] == '=' {
            continue;
        }
        if i > 0 {
            let prev = chars[i - 1];
            match prev {
                '!' | '<' | '>' | '=' => continue,
                '+' | '-' | '*' | '/' | '%' | '&' | '|' | '^' | '~' => return true,
                _ => return true,
            }
        } else {
            return true;
        }
    }
    false
}

fn is_call_statement(line: &str) -> bool {
    if !line.ends_with(')') {
        return false;
    }
    let mut depth: i32 = 0;
    for ch in line.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    if depth != 0 {
        return false;
    }
    !line.starts_with('(')
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_bare_expression() {
        assert_eq!(maybe_wrap_last_expr("1 + 1"), "__result__ = 1 + 1");
    }

    #[test]
    fn test_no_wrap_assignment() {
        assert_eq!(maybe_wrap_last_expr("x = 1"), "x = 1");
    }

    #[test]
    fn test_wrap_multiline_last_expr() {
        let code = "x = 5\nx * 2";
        assert_eq!(maybe_wrap_last_expr(code), "x = 5\n__result__ = x * 2");
    }

    #[test]
    fn test_no_wrap_call_print() {
        let code = "x = 1\nprint(x)";
        assert_eq!(maybe_wrap_last_expr(code), code);
    }

    #[test]
    fn test_no_wrap_empty() {
        assert_eq!(maybe_wrap_last_expr(""), "");
    }

    #[test]
    fn test_no_wrap_def() {
        assert_eq!(maybe_wrap_last_expr("def f(): pass"), "def f(): pass");
    }

    #[test]
    fn test_no_wrap_import() {
        assert_eq!(maybe_wrap_last_expr("import math"), "import math");
    }

    #[test]
    fn test_no_wrap_augmented_assignment() {
        assert_eq!(maybe_wrap_last_expr("x += 1"), "x += 1");
    }

    #[test]
    fn test_wrap_comparison_expr() {
        assert_eq!(maybe_wrap_last_expr("x == 1"), "__result__ = x == 1");
    }

    #[test]
    fn test_timeout_message_format() {
        assert_eq!(
            timeout_message(15),
            "Code is executing for too long (>15 secs). Quota over.\n"
        );
    }
}
