//! Scoped capture hooks for the interpreter worker.
//!
//! A [`CaptureHook`] is a reversible rebinding of some callable or object in
//! the interpreter runtime: installing it swaps the binding for an
//! instrumented version, and the returned [`Restore`] keeps the original
//! reachable so the instrumented code can delegate to it explicitly (never by
//! calling the name it replaced). [`with_hooks`] activates an ordered set of
//! hooks around one execution and restores the prior bindings on every exit
//! path, including Python exceptions.
//!
//! The broker holds the registry as an ordered list of hook names and passes
//! it to each worker at spawn time; edits after a worker started do not
//! affect that worker.

use rustpython_vm::{
    builtins::{PyBytes, PyStr},
    function::FuncArgs,
    AsObject, PyObjectRef, PyResult, VirtualMachine,
};

use crate::error::CillowError;
use crate::protocol::FrameSink;

/// Hook names installed when no explicit list is configured.
pub const DEFAULT_HOOKS: &[&str] = &["stdout", "stderr", "artifact"];

// ── Hook abstraction ─────────────────────────────────────────────────────────

/// A reversible, scoped rebinding inside the worker runtime.
pub trait CaptureHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// Swap the target binding for an instrumented one. The returned
    /// [`Restore`] owns the original binding.
    fn install(&self, vm: &VirtualMachine, sink: &FrameSink) -> PyResult<Restore>;
}

enum RestoreTarget {
    SysAttr(&'static str),
    SysModulesEntry(&'static str),
}

/// The saved original binding of one installed hook.
pub struct Restore {
    target: RestoreTarget,
    original: Option<PyObjectRef>,
}

impl Restore {
    /// The original binding, still callable by instrumented code.
    pub fn original(&self) -> Option<&PyObjectRef> {
        self.original.as_ref()
    }

    fn uninstall(self, vm: &VirtualMachine) {
        match self.target {
            RestoreTarget::SysAttr(attr) => {
                if let Some(original) = self.original {
                    let _ = vm.sys_module.set_attr(attr, original, vm);
                }
            }
            RestoreTarget::SysModulesEntry(name) => {
                if let Ok(modules) = vm.sys_module.get_attr("modules", vm) {
                    match self.original {
                        Some(original) => {
                            let _ = vm.call_method(
                                &modules,
                                "__setitem__",
                                (vm.ctx.new_str(name), original),
                            );
                        }
                        None => {
                            let _ = vm.call_method(
                                &modules,
                                "__delitem__",
                                (vm.ctx.new_str(name),),
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Install `hooks` in registration order, run `f`, then restore the prior
/// bindings in reverse order — also when installation or `f` fails.
pub fn with_hooks<T, F>(
    vm: &VirtualMachine,
    hooks: &[Box<dyn CaptureHook>],
    sink: &FrameSink,
    f: F,
) -> PyResult<T>
where
    F: FnOnce(&VirtualMachine) -> PyResult<T>,
{
    let mut installed = Vec::with_capacity(hooks.len());
    for hook in hooks {
        match hook.install(vm, sink) {
            Ok(restore) => installed.push(restore),
            Err(err) => {
                for restore in installed.into_iter().rev() {
                    restore.uninstall(vm);
                }
                return Err(err);
            }
        }
    }
    let result = f(vm);
    for restore in installed.into_iter().rev() {
        restore.uninstall(vm);
    }
    result
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Process-wide ordered list of capture hooks.
pub struct HookRegistry {
    hooks: Vec<Box<dyn CaptureHook>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Build a registry from built-in hook names, preserving order.
    pub fn builtin(names: &[String]) -> Result<Self, CillowError> {
        let mut registry = Self::empty();
        for name in names {
            match name.as_str() {
                "stdout" => registry.register(Box::new(StreamHook::stdout())),
                "stderr" => registry.register(Box::new(StreamHook::stderr())),
                "artifact" => registry.register(Box::new(ArtifactHook)),
                other => return Err(CillowError::UnknownHook(other.to_string())),
            }
        }
        Ok(registry)
    }

    /// Append a hook. Hooks compose by nesting in registration order.
    pub fn register(&mut self, hook: Box<dyn CaptureHook>) {
        self.hooks.push(hook);
    }

    pub fn hooks(&self) -> &[Box<dyn CaptureHook>] {
        &self.hooks
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }
}

// ── Built-in hooks ───────────────────────────────────────────────────────────

/// Swaps `sys.stdout` or `sys.stderr` for a writer that emits stream frames
/// as chunks are produced.
pub struct StreamHook {
    attr: &'static str,
}

impl StreamHook {
    pub fn stdout() -> Self {
        Self { attr: "stdout" }
    }

    pub fn stderr() -> Self {
        Self { attr: "stderr" }
    }
}

impl CaptureHook for StreamHook {
    fn name(&self) -> &'static str {
        self.attr
    }

    fn install(&self, vm: &VirtualMachine, sink: &FrameSink) -> PyResult<Restore> {
        let original = vm.sys_module.get_attr(self.attr, vm).ok();
        let writer = build_stream_writer(vm, sink.clone(), self.attr);
        vm.sys_module.set_attr(self.attr, writer, vm)?;
        Ok(Restore {
            target: RestoreTarget::SysAttr(self.attr),
            original,
        })
    }
}

/// Build a minimal Python object with `write(s)` and `flush()` methods whose
/// writes become `Stream` frames tagged with `stream`.
fn build_stream_writer(vm: &VirtualMachine, sink: FrameSink, stream: &'static str) -> PyObjectRef {
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let text: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            if !text.is_empty() {
                sink.stream(stream, &text).map_err(|err| {
                    vm.new_runtime_error(format!("output channel closed: {err}"))
                })?;
            }
            Ok(vm.ctx.new_int(text.len()).into())
        },
    );

    let flush_fn = vm.new_function(
        "flush",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            Ok(vm.ctx.none())
        },
    );

    // A module works as a plain writable namespace.
    let ns = vm.new_module("<capture>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

/// Registers a `_cillow` module whose `emit(stream, data, id=None)` produces
/// byte-stream frames. Graphics patches (e.g. an image-`show` rebinding)
/// call this seam with the rendered bytes.
pub struct ArtifactHook;

impl CaptureHook for ArtifactHook {
    fn name(&self) -> &'static str {
        "artifact"
    }

    fn install(&self, vm: &VirtualMachine, sink: &FrameSink) -> PyResult<Restore> {
        let sink = sink.clone();
        let emit_fn = vm.new_function(
            "emit",
            move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                let stream = args
                    .args
                    .first()
                    .and_then(|o| o.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()))
                    .ok_or_else(|| {
                        vm.new_type_error("emit() requires a stream kind string".to_owned())
                    })?;

                let data = args.args.get(1).ok_or_else(|| {
                    vm.new_type_error("emit() requires a bytes payload".to_owned())
                })?;
                let bytes = if let Some(b) = data.downcast_ref::<PyBytes>() {
                    b.as_bytes().to_vec()
                } else if let Some(s) = data.downcast_ref::<PyStr>() {
                    s.as_str().as_bytes().to_vec()
                } else {
                    return Err(vm.new_type_error(
                        "emit() payload must be bytes or str".to_owned(),
                    ));
                };

                let id = args
                    .args
                    .get(2)
                    .filter(|o| !vm.is_none(o))
                    .and_then(|o| o.str(vm).ok())
                    .map(|s| s.as_str().to_owned());

                sink.byte_stream(&stream, id, bytes).map_err(|err| {
                    vm.new_runtime_error(format!("output channel closed: {err}"))
                })?;
                Ok(vm.ctx.none())
            },
        );

        let module = vm.new_module("_cillow", vm.ctx.new_dict(), None);
        module.set_attr("emit", emit_fn, vm)?;

        let modules = vm.sys_module.get_attr("modules", vm)?;
        let original = vm
            .call_method(&modules, "get", (vm.ctx.new_str("_cillow"),))
            .ok()
            .filter(|existing| !vm.is_none(existing));
        vm.call_method(
            &modules,
            "__setitem__",
            (vm.ctx.new_str("_cillow"), module.as_object().to_owned()),
        )?;

        Ok(Restore {
            target: RestoreTarget::SysModulesEntry("_cillow"),
            original,
        })
    }
}
