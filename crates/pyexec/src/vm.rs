//! RustPython VM lifecycle for the pyexec library.
//!
//! This module owns all RustPython API calls. It:
//! - Builds one interpreter per [`crate::session::InterpreterSession`], with
//!   stdlib, an import allowlist hook, output capture, an `input()` override,
//!   and a frozen `matplotlib`/`matplotlib.pyplot` stub module installed.
//! - Compiles and executes Python source, returning a [`VmRunResult`].
//! - Extracts structured errors (SyntaxError, RuntimeError, ModuleNotAllowed).
//! - Extracts the `__result__` return value from the scope after execution.
//!
//! ## Import hook
//!
//! RustPython 0.3 resolves imports by calling `builtins.__import__`. We
//! override it with a native function that checks the module allowlist and
//! otherwise delegates to the original. The hook is (re)installed at the
//! start of every [`run_code`] call, using a saved copy of the real
//! `__import__` so repeated installs on the same long-lived interpreter
//! don't layer hook-on-hook.
//!
//! ## Output capture and side effects
//!
//! `sys.stdout`/`sys.stderr` are replaced with minimal Python objects whose
//! `write(s)` forwards to an [`EventSink`], which streams the write to the
//! kernel thread as a [`SessionEvent`] rather than accumulating it — chunking
//! by newline is the kernel's job (see the control loop's
//! `publish_stdout`/`publish_stderr`), not the VM's.
//!
//! `matplotlib.pyplot.show()`/`savefig()` call back into the sink's
//! `matplotlib` channel via a frozen Python stub (§4.2's three side-effect
//! channels).
//!
//! ## Zero unsafe blocks
//!
//! This file contains no `unsafe` code. All RustPython integration uses the
//! safe public Rust API.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

use rustpython_vm::{
    builtins::PyBaseExceptionRef,
    compiler::Mode,
    function::FuncArgs,
    scope::Scope,
    AsObject, Interpreter, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::modules::check_module_allowed;
use crate::session::EventSink;
use crate::types::ExecutionError;

/// A 1x1 transparent PNG, used as the rendered-figure payload for the
/// matplotlib stub (real figure rasterization is out of scope — see
/// DESIGN.md).
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

/// Module names the import hook always admits regardless of the configured
/// allowlist — the matplotlib stub is a sandboxed in-process shim, not a
/// capability to gate.
const ALWAYS_ALLOWED_MODULES: &[&str] = &["matplotlib", "matplotlib.pyplot"];

// ── Public (crate-visible) types ─────────────────────────────────────────────

/// Internal result of running code in the VM.
pub(crate) struct VmRunResult {
    pub return_value: Option<String>,
    pub error: Option<ExecutionError>,
}

/// A configured interpreter bundled with its module allowlist and the one
/// global scope every `run_code` call on this session reuses — this is what
/// makes `i = 2` in one call visible to `print(i)` in the next.
pub(crate) struct PyInterp {
    inner: Interpreter,
    allowed_set: Arc<HashSet<String>>,
    scope: RefCell<Option<Scope>>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Return candidate filesystem paths for a Python standard library
/// installation, so RustPython can resolve pure-Python stdlib modules
/// (json, collections, re, datetime, etc.) from the host's Python install.
fn python_stdlib_paths() -> Vec<String> {
    let candidates = [
        "/usr/local/lib/python3.13",
        "/usr/local/lib/python3.12",
        "/usr/local/lib/python3.11",
        "/usr/local/lib/python3.10",
        "/usr/local/lib/python3.9",
        "/usr/lib/python3",
        "/usr/lib/python3.12",
        "/usr/lib/python3.11",
        "/usr/lib/python3.10",
    ];
    candidates
        .iter()
        .filter(|p| std::path::Path::new(p).is_dir())
        .map(|p| p.to_string())
        .collect()
}

/// Create a new RustPython interpreter with stdlib, the matplotlib stub, and
/// JSON support configured. The import hook, output capture, and `input()`
/// override are installed per-call inside [`run_code`], since they depend on
/// a live [`EventSink`].
pub(crate) fn build_interpreter(allowed_set: HashSet<String>) -> PyInterp {
    let mut settings = rustpython_vm::Settings::default();
    for path in python_stdlib_paths() {
        settings.path_list.push(path);
    }

    let inner = Interpreter::with_init(settings, move |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());

        vm.add_frozen(rustpython_vm::py_freeze!(
            source = r#"
import _json

class JSONDecodeError(ValueError):
    def __init__(self, msg, doc, pos):
        errmsg = '%s: line %d column %d (char %d)' % (
            msg,
            doc.count('\n', 0, pos) + 1,
            pos - doc.rfind('\n', 0, pos),
            pos,
        )
        ValueError.__init__(self, errmsg)
        self.msg = msg
        self.doc = doc
        self.pos = pos
        self.lineno = doc.count('\n', 0, pos) + 1
        self.colno = pos - doc.rfind('\n', 0, pos)

class JSONEncoder:
    def __init__(self, skipkeys=False, ensure_ascii=True,
                 check_circular=True, allow_nan=True, sort_keys=False,
                 indent=None, separators=None, default=None):
        self.skipkeys = skipkeys
        self.ensure_ascii = ensure_ascii
        self.check_circular = check_circular
        self.allow_nan = allow_nan
        self.sort_keys = sort_keys
        self.indent = indent
        if separators is not None:
            self.item_separator, self.key_separator = separators
        elif indent is not None:
            self.item_separator = ','
            self.key_separator = ': '
        else:
            self.item_separator = ', '
            self.key_separator = ': '
        self.default = default if default is not None else self._default

    def _default(self, obj):
        raise TypeError(f'Object of type {type(obj).__name__} is not JSON serializable')

    def encode(self, o):
        return _simple_encode(o, self)

    def iterencode(self, o, _one_shot=False):
        return iter([self.encode(o)])

def _simple_encode(obj, encoder):
    if obj is None:
        return 'null'
    elif obj is True:
        return 'true'
    elif obj is False:
        return 'false'
    elif isinstance(obj, int):
        return str(obj)
    elif isinstance(obj, float):
        if obj != obj:
            return 'NaN'
        elif obj == float('inf'):
            return 'Infinity'
        elif obj == float('-inf'):
            return '-Infinity'
        return repr(obj)
    elif isinstance(obj, str):
        return _encode_str(obj)
    elif isinstance(obj, (list, tuple)):
        if not obj:
            return '[]'
        items = [_simple_encode(v, encoder) for v in obj]
        return '[' + ', '.join(items) + ']'
    elif isinstance(obj, dict):
        if not obj:
            return '{}'
        keys = sorted(obj.keys()) if encoder.sort_keys else obj.keys()
        items = [_encode_str(str(k)) + ': ' + _simple_encode(v, encoder) for k, v in ((k, obj[k]) for k in keys)]
        return '{' + ', '.join(items) + '}'
    else:
        return encoder.default(obj)

def _encode_str(s):
    result = ['"']
    for c in s:
        if c == '"':
            result.append('\\"')
        elif c == '\\':
            result.append('\\\\')
        elif c == '\n':
            result.append('\\n')
        elif c == '\r':
            result.append('\\r')
        elif c == '\t':
            result.append('\\t')
        elif ord(c) < 0x20:
            result.append('\\u{:04x}'.format(ord(c)))
        else:
            result.append(c)
    result.append('"')
    return ''.join(result)

def dumps(obj, *, skipkeys=False, ensure_ascii=True, check_circular=True,
          allow_nan=True, cls=None, indent=None, separators=None, default=None,
          sort_keys=False, **kw):
    encoder = (cls or JSONEncoder)(
        skipkeys=skipkeys, ensure_ascii=ensure_ascii,
        check_circular=check_circular, allow_nan=allow_nan,
        indent=indent, separators=separators, default=default,
        sort_keys=sort_keys, **kw
    )
    return encoder.encode(obj)

def dump(obj, fp, **kwargs):
    fp.write(dumps(obj, **kwargs))

def loads(s, *, cls=None, object_hook=None, parse_float=None,
          parse_int=None, parse_constant=None, object_pairs_hook=None, **kw):
    if isinstance(s, (bytes, bytearray)):
        s = s.decode('utf-8')
    decoder = JSONDecoder(object_hook=object_hook, object_pairs_hook=object_pairs_hook,
                          parse_float=parse_float, parse_int=parse_int, strict=True)
    return decoder.decode(s)

def load(fp, **kwargs):
    return loads(fp.read(), **kwargs)

class JSONDecoder:
    def __init__(self, *, object_hook=None, parse_float=None, parse_int=None,
                 parse_constant=None, strict=True, object_pairs_hook=None):
        self.object_hook = object_hook
        self.object_pairs_hook = object_pairs_hook
        self.parse_float = parse_float or float
        self.parse_int = parse_int or int
        self.strict = strict
        self.scan_once = _json.make_scanner(self)

    def decode(self, s, _w=None):
        obj, end = self.raw_decode(s, 0)
        end = len(s.lstrip()) if not s else end
        return obj

    def raw_decode(self, s, idx=0):
        try:
            obj, end = self.scan_once(s, idx)
        except StopIteration as err:
            raise JSONDecodeError("Expecting value", s, err.value) from None
        return obj, end
"#,
            module_name = "json"
        ));

        // `py_freeze!` always marks a single-file module as non-package; flip
        // that bit by hand so `matplotlib.pyplot` resolves as a submodule of
        // `matplotlib` rather than failing with "not a package".
        let matplotlib_pkg: Vec<(&'static str, rustpython_vm::frozen::FrozenModule)> =
            rustpython_vm::py_freeze!(source = "", module_name = "matplotlib")
                .into_iter()
                .map(|(name, mut module)| {
                    module.package = true;
                    (name, module)
                })
                .collect();
        vm.add_frozen(matplotlib_pkg);

        vm.add_frozen(rustpython_vm::py_freeze!(
            source = r#"
_current_figure = None

class Figure:
    def savefig(self, *args, **kwargs):
        __plutoid_emit_matplotlib__()

    def show(self, *args, **kwargs):
        __plutoid_emit_matplotlib__()

def figure(*args, **kwargs):
    global _current_figure
    _current_figure = Figure()
    return _current_figure

def plot(*args, **kwargs):
    global _current_figure
    if _current_figure is None:
        _current_figure = Figure()
    return []

def scatter(*args, **kwargs):
    return plot(*args, **kwargs)

def xlabel(*args, **kwargs):
    pass

def ylabel(*args, **kwargs):
    pass

def title(*args, **kwargs):
    pass

def legend(*args, **kwargs):
    pass

def show(*args, **kwargs):
    __plutoid_emit_matplotlib__()

def savefig(*args, **kwargs):
    __plutoid_emit_matplotlib__()
"#,
            module_name = "matplotlib.pyplot"
        ));
    });

    PyInterp {
        inner,
        allowed_set: Arc::new(allowed_set),
        scope: RefCell::new(None),
    }
}

/// Execute Python source code in the VM, streaming side effects through
/// `sink` as they happen.
///
/// Installs the import allowlist hook, output capture, `input()` override,
/// and matplotlib emitter at the start of every call — they are idempotent
/// (each install replaces the previous call's closures, which captured the
/// previous call's now-stale `EventSink`).
pub(crate) fn run_code(interp: &PyInterp, code_str: &str, sink: &EventSink) -> VmRunResult {
    let allowed_set = Arc::clone(&interp.allowed_set);

    interp.inner.enter(|vm| {
        install_import_hook(vm, &allowed_set);
        install_output_capture(vm, sink);
        install_input_override(vm, sink);
        install_matplotlib_emitter(vm, sink);

        let code = match vm.compile(code_str, Mode::Exec, "<string>".to_owned()) {
            Ok(c) => c,
            Err(e) => {
                return VmRunResult {
                    return_value: None,
                    error: Some(extract_syntax_error(e)),
                };
            }
        };

        let scope = interp
            .scope
            .borrow_mut()
            .get_or_insert_with(|| {
                let scope = vm.new_scope_with_builtins();
                let _ = scope
                    .globals
                    .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);
                scope
            })
            .clone();
        let exec_result = vm.run_code_obj(code, scope.clone());

        match exec_result {
            Ok(_) => VmRunResult {
                return_value: extract_return_value(vm, &scope),
                error: None,
            },
            Err(exc) => {
                if let Some(module_err) = extract_module_not_allowed(vm, &exc) {
                    return VmRunResult {
                        return_value: None,
                        error: Some(module_err),
                    };
                }
                VmRunResult {
                    return_value: None,
                    error: Some(extract_runtime_error(vm, exc)),
                }
            }
        }
    })
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Returns `true` if the import is originating from user code (not from
/// stdlib). User code (compiled from a string) runs with
/// `__name__ == "__main__"`; real modules have their own `__name__`.
fn is_user_code_import(args: &FuncArgs, vm: &VirtualMachine) -> bool {
    let globals = match args.args.get(1) {
        Some(g) => g,
        None => return true,
    };
    if vm.is_none(globals) {
        return true;
    }

    if let Ok(name_val) = vm.call_method(globals, "get", (vm.ctx.new_str("__name__"),)) {
        if !vm.is_none(&name_val) {
            if let Ok(name_str) = name_val.str(vm) {
                let name = name_str.as_str();
                if !name.is_empty() && name != "__main__" {
                    return false;
                }
                if name == "__main__" {
                    return true;
                }
            }
        }
    }

    let file_val = vm
        .call_method(globals, "get", (vm.ctx.new_str("__file__"),))
        .ok();
    match file_val {
        None => true,
        Some(v) if vm.is_none(&v) => false,
        Some(v) => v
            .str(vm)
            .map(|s| {
                let file = s.as_str();
                file == "<string>" || file == "<stdin>" || file == "<module>" || file.is_empty()
            })
            .unwrap_or(true),
    }
}

/// Check if `module_name` is allowed, considering submodule imports and the
/// always-allowed stub modules.
fn is_module_allowed(module_name: &str, allowed_set: &HashSet<String>) -> bool {
    if ALWAYS_ALLOWED_MODULES.contains(&module_name) {
        return true;
    }
    if check_module_allowed(module_name, allowed_set).is_ok() {
        return true;
    }
    if let Some(dot_pos) = module_name.find('.') {
        let parent = &module_name[..dot_pos];
        if ALWAYS_ALLOWED_MODULES.contains(&parent) {
            return true;
        }
        if check_module_allowed(parent, allowed_set).is_ok() {
            return true;
        }
    }
    false
}

/// Install `builtins.__import__` override that enforces the module
/// allowlist, delegating to the real `__import__` for allowed modules.
fn install_import_hook(vm: &VirtualMachine, allowed_set: &Arc<HashSet<String>>) {
    const SAVED_IMPORT_ATTR: &str = "__pyexec_original_import__";

    let original_import = if let Ok(saved) = vm.builtins.get_attr(SAVED_IMPORT_ATTR, vm) {
        saved
    } else {
        let real_original = match vm.builtins.get_attr("__import__", vm) {
            Ok(f) => f,
            Err(_) => return,
        };
        let _ = vm
            .builtins
            .set_attr(SAVED_IMPORT_ATTR, real_original.clone(), vm);
        real_original
    };

    #[allow(clippy::arc_with_non_send_sync)]
    let original_import = Arc::new(original_import);
    let allowed_set = Arc::clone(allowed_set);

    let hook = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            let level: i64 = args
                .args
                .get(4)
                .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
                .unwrap_or(0);

            let full_module_name = if level > 0 {
                let package = args.args.get(1).and_then(|globals| {
                    vm.call_method(globals, "get", (vm.ctx.new_str("__package__"),))
                        .ok()
                        .filter(|v| !vm.is_none(v))
                        .and_then(|v| v.str(vm).ok())
                        .map(|s| s.as_str().to_owned())
                });
                if let Some(pkg) = package {
                    let base = if level > 1 {
                        let parts: Vec<&str> = pkg.split('.').collect();
                        let keep = parts.len().saturating_sub((level - 1) as usize);
                        parts[..keep].join(".")
                    } else {
                        pkg.clone()
                    };
                    if module_name.is_empty() {
                        base
                    } else {
                        format!("{base}.{module_name}")
                    }
                } else {
                    module_name.clone()
                }
            } else {
                module_name.clone()
            };

            let importing_from_user_code = is_user_code_import(&args, vm);

            if importing_from_user_code {
                let allowed = is_module_allowed(&full_module_name, &allowed_set);
                if !allowed {
                    let deny_name = if full_module_name != module_name {
                        full_module_name.clone()
                    } else {
                        module_name.clone()
                    };
                    return Err(vm.new_import_error(
                        format!("ModuleNotAllowed:{deny_name}"),
                        vm.ctx.new_str(deny_name),
                    ));
                }
            }

            original_import.call(args, vm)
        },
    );

    let _ = vm.builtins.set_attr("__import__", hook, vm);
}

/// Replace `sys.stdout`/`sys.stderr` with write-capturing objects that
/// forward each write to the [`EventSink`].
fn install_output_capture(vm: &VirtualMachine, sink: &EventSink) {
    let stdout_obj = build_writer_object(vm, sink.clone(), true);
    let stderr_obj = build_writer_object(vm, sink.clone(), false);
    let _ = vm.sys_module.set_attr("stdout", stdout_obj, vm);
    let _ = vm.sys_module.set_attr("stderr", stderr_obj, vm);
}

fn build_writer_object(vm: &VirtualMachine, sink: EventSink, is_stdout: bool) -> PyObjectRef {
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();

            let result = if is_stdout {
                sink.stdout(&data)
            } else {
                sink.stderr(&data)
            };

            match result {
                Ok(()) => Ok(vm.ctx.new_int(data.len()).into()),
                Err(limit_bytes) => Err(vm.new_exception_msg(
                    vm.ctx.exceptions.runtime_error.to_owned(),
                    format!("Output limit exceeded: {limit_bytes} bytes"),
                )),
            }
        },
    );

    let flush_fn = vm.new_function(
        "flush",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

/// Override the `input()` builtin so the program's call synchronously
/// reaches the kernel thread via [`EventSink::input`].
fn install_input_override(vm: &VirtualMachine, sink: &EventSink) {
    let sink = sink.clone();
    let input_fn = vm.new_function(
        "input",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let prompt: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            let line = sink.input(&prompt);
            Ok(vm.ctx.new_str(line).into())
        },
    );
    let _ = vm.builtins.set_attr("input", input_fn, vm);
}

/// Install `__plutoid_emit_matplotlib__`, the native hook the frozen
/// `matplotlib.pyplot` stub calls on `show()`/`savefig()`.
fn install_matplotlib_emitter(vm: &VirtualMachine, sink: &EventSink) {
    let sink = sink.clone();
    let emit_fn = vm.new_function(
        "__plutoid_emit_matplotlib__",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            sink.matplotlib("image/png", PLACEHOLDER_PNG.to_vec());
            Ok(vm.ctx.none())
        },
    );
    let _ = vm.builtins.set_attr("__plutoid_emit_matplotlib__", emit_fn, vm);
}

/// Convert a RustPython compile error into [`ExecutionError::SyntaxError`].
fn extract_syntax_error(err: rustpython_vm::compiler::CompileError) -> ExecutionError {
    let (row, col) = err.python_location();
    ExecutionError::SyntaxError {
        message: err.to_string(),
        line: row as u32,
        col: col as u32,
    }
}

/// Extract a [`ExecutionError::ModuleNotAllowed`] if the exception
/// originated from our import hook sentinel.
fn extract_module_not_allowed(
    vm: &VirtualMachine,
    exc: &PyBaseExceptionRef,
) -> Option<ExecutionError> {
    let msg = exc.as_object().str(vm).ok()?;
    let s = msg.as_str();
    s.strip_prefix("ModuleNotAllowed:")
        .map(|name| ExecutionError::ModuleNotAllowed {
            module_name: name.to_string(),
        })
}

/// Convert a RustPython runtime exception into
/// [`ExecutionError::RuntimeError`], with a formatted traceback.
fn extract_runtime_error(vm: &VirtualMachine, exc: PyBaseExceptionRef) -> ExecutionError {
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "Unknown runtime error".to_owned());

    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, &exc);

    ExecutionError::RuntimeError { message, traceback }
}

/// Try to extract the last expression value from the execution scope via
/// the `__result__` variable name convention (see
/// [`crate::executor::maybe_wrap_last_expr`]).
fn extract_return_value(vm: &VirtualMachine, scope: &Scope) -> Option<String> {
    let locals_obj: PyObjectRef = scope.locals.as_ref().to_owned();
    let result_obj = vm
        .call_method(&locals_obj, "get", (vm.ctx.new_str("__result__"),))
        .ok()?;
    if vm.is_none(&result_obj) {
        return None;
    }
    result_obj.repr(vm).ok().map(|s| s.as_str().to_owned())
}
