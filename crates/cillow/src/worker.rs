//! Interpreter worker runtime: the child-process side of the broker channel.
//!
//! A worker is a single-process, single-threaded evaluator bound to one
//! environment for its whole life. Startup order: activate the environment,
//! build the hook registry and the interpreter session, report `Ready`, then
//! loop — read one request frame from stdin, dispatch by kind, emit zero or
//! more stream frames, then at most one of `Result`/`Exception`, then
//! exactly one `End`. End-of-stream on stdin is the broker closing the
//! channel; the worker exits cleanly.
//!
//! Frames travel on stdout, so the worker's own logging goes to stderr.

use std::io::{self, Read, Write};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{CillowError, ErrorKind, Exception};
use crate::hooks::HookRegistry;
use crate::inspect::unresolved_imports;
use crate::install::{install_packages, stream_child_output};
use crate::interp::InterpreterSession;
use crate::protocol::{
    decode_request, read_frame_buf, Environment, FrameSink, Request, ResponseFrame,
};

/// Options the broker passes on the worker command line.
pub struct WorkerOptions {
    pub env: Environment,
    pub hooks: Vec<String>,
}

/// Entry point for the `worker` subcommand: serve requests over stdio until
/// the broker closes the channel.
pub fn run(options: WorkerOptions) -> Result<(), CillowError> {
    let stdin = io::stdin();
    serve(options, stdin.lock(), Box::new(io::stdout()))
}

/// The worker main loop over explicit channel ends (testable with buffers).
pub fn serve<R: Read>(
    options: WorkerOptions,
    mut requests: R,
    out: Box<dyn Write + Send>,
) -> Result<(), CillowError> {
    let sink = FrameSink::new(out);

    activate_environment(&options.env);

    let registry = HookRegistry::builtin(&options.hooks)?;
    info!(env = %options.env.as_wire(), hooks = ?registry.names(), "worker starting");
    let mut session = InterpreterSession::new(&options.env);
    sink.emit(&ResponseFrame::Ready)?;

    while let Some(buf) = read_frame_buf(&mut requests)? {
        match decode_request(&buf) {
            Ok(request) => {
                handle_request(&mut session, &registry, &options.env, &sink, request)?
            }
            Err(err) => {
                warn!(%err, "malformed request frame");
                sink.emit(&ResponseFrame::Exception(Exception::new(
                    ErrorKind::MalformedRequest,
                    err.to_string(),
                )))?;
                sink.emit(&ResponseFrame::End)?;
            }
        }
    }

    debug!("request channel closed; worker exiting");
    Ok(())
}

/// Prepend the environment's `bin` directory to `PATH` so subprocesses and
/// the installer resolve the environment's tools first.
fn activate_environment(env: &Environment) {
    let Some(bin) = env.bin_dir() else { return };
    let path = std::env::var_os("PATH").unwrap_or_default();
    let mut parts = vec![bin];
    parts.extend(std::env::split_paths(&path));
    if let Ok(joined) = std::env::join_paths(parts) {
        std::env::set_var("PATH", joined);
    }
}

fn handle_request(
    session: &mut InterpreterSession,
    registry: &HookRegistry,
    env: &Environment,
    sink: &FrameSink,
    request: Request,
) -> Result<(), CillowError> {
    let outcome = match request {
        Request::RunCode { source, .. } => run_code(session, registry, env, sink, &source),
        Request::RunCommand { argv, .. } => run_command(sink, &argv),
        Request::InstallRequirements { names, .. } => {
            install_packages(env, &names, sink).map(|()| None)
        }
        Request::SetEnvVars { vars, .. } => {
            for (key, value) in vars {
                if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0')
                {
                    warn!(name = %key, "skipping invalid environment variable");
                    continue;
                }
                std::env::set_var(key, value);
            }
            Ok(None)
        }
        Request::SwitchInterpreter { .. }
        | Request::DeleteInterpreter { .. }
        | Request::ShutdownClient => Err(Exception::new(
            ErrorKind::MalformedRequest,
            "request kind is handled by the broker",
        )),
    };

    match outcome {
        Ok(value) => sink.emit(&ResponseFrame::Result {
            value: value.unwrap_or(serde_json::Value::Null),
        })?,
        Err(exception) => sink.emit(&ResponseFrame::Exception(exception))?,
    }
    sink.emit(&ResponseFrame::End)
}

/// `run_code` dispatch: discover and install missing dependencies, then
/// execute against the persistent namespace with hooks active.
fn run_code(
    session: &mut InterpreterSession,
    registry: &HookRegistry,
    env: &Environment,
    sink: &FrameSink,
    source: &str,
) -> Result<Option<serde_json::Value>, Exception> {
    let missing = unresolved_imports(source, session.resolve_context());
    if !missing.is_empty() {
        let names: Vec<String> = missing.into_iter().collect();
        debug!(?names, "auto-installing unresolved imports");
        if let Err(failure) = install_packages(env, &names, sink) {
            // Reported verbatim; execution proceeds, and a still-missing
            // import then fails as a normal user error.
            let _ = sink.stream("installer", &format!("{}\n", failure.message));
        }
    }

    session.run_code(source, registry.hooks(), sink)
}

/// `run_command` dispatch: spawn the argv, stream its output, and return the
/// exit code as the result value.
fn run_command(
    sink: &FrameSink,
    argv: &[String],
) -> Result<Option<serde_json::Value>, Exception> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Exception::new(ErrorKind::CommandError, "empty argv"))?;
    let mut command = Command::new(program);
    command.args(args);
    let status = stream_child_output(command, sink, "stdout", "stderr").map_err(|err| {
        Exception::new(
            ErrorKind::CommandError,
            format!("failed to spawn {program}: {err}"),
        )
    })?;
    Ok(Some(serde_json::Value::from(status.code().unwrap_or(-1))))
}
