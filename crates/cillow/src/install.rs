//! Package installation into a target environment.
//!
//! The installer shells out rather than vendoring resolver logic: `uv pip`
//! when `uv` is discoverable on `PATH` (much faster), otherwise
//! `python3 -m pip`. Directory environments install into their
//! `site-packages`; the sentinel environment installs into the ambient
//! interpreter. Installer output is forwarded as `installer`-tagged stream
//! frames while the subprocess runs, so clients can surface progress.

use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, warn};

use crate::error::{ErrorKind, Exception};
use crate::protocol::{Environment, FrameSink};

const CHUNK_SIZE: usize = 8192;

/// Locate `name` on `PATH`.
pub fn find_program(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// The argv used to install `names` into `env`, given the resolved `uv`
/// location (if any). Split out from the spawn so selection is testable.
pub fn installer_argv(env: &Environment, names: &[String], uv: Option<&PathBuf>) -> Vec<OsString> {
    let mut argv: Vec<OsString> = match uv {
        Some(uv) => vec![uv.into(), "pip".into(), "install".into()],
        None => vec!["python3".into(), "-m".into(), "pip".into(), "install".into()],
    };
    if let Some(site) = env.site_packages() {
        argv.push("--target".into());
        argv.push(site.into());
    }
    argv.extend(names.iter().map(OsString::from));
    argv
}

/// Install `names` into `env`, streaming installer output through `sink`.
///
/// Zero exit is silent success (no terminal frame — the caller continues to
/// the real work). Non-zero exit or a spawn failure yields an
/// `InstallerError` exception value; nothing is retried.
pub fn install_packages(
    env: &Environment,
    names: &[String],
    sink: &FrameSink,
) -> Result<(), Exception> {
    if names.is_empty() {
        return Ok(());
    }

    if let Some(site) = env.site_packages() {
        std::fs::create_dir_all(&site).map_err(|err| {
            Exception::new(
                ErrorKind::InstallerError,
                format!("cannot create {}: {err}", site.display()),
            )
        })?;
    }

    let uv = find_program("uv");
    let argv = installer_argv(env, names, uv.as_ref());
    debug!(?argv, "running installer");

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);

    let status = stream_child_output(command, sink, "installer", "installer").map_err(|err| {
        Exception::new(
            ErrorKind::InstallerError,
            format!("failed to run installer: {err}"),
        )
    })?;

    if status.success() {
        Ok(())
    } else {
        warn!(%status, "installer failed");
        Err(Exception::new(
            ErrorKind::InstallerError,
            format!("installer exited with {status} for packages: {}", names.join(", ")),
        ))
    }
}

/// Spawn `command` with piped output and forward both pipes through `sink`
/// as stream frames, chunk by chunk, until the child exits.
///
/// One forwarding thread per pipe; frames from the two streams interleave in
/// production order through the sink's internal lock.
pub(crate) fn stream_child_output(
    mut command: Command,
    sink: &FrameSink,
    stdout_tag: &str,
    stderr_tag: &str,
) -> std::io::Result<ExitStatus> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    std::thread::scope(|scope| {
        if let Some(stdout) = stdout {
            scope.spawn(|| forward_pipe(stdout, sink, stdout_tag));
        }
        if let Some(stderr) = stderr {
            scope.spawn(|| forward_pipe(stderr, sink, stderr_tag));
        }
    });

    child.wait()
}

fn forward_pipe<R: Read>(mut pipe: R, sink: &FrameSink, tag: &str) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                if sink.stream(tag, &text).is_err() {
                    break; // Channel gone; stop forwarding, let the child finish.
                }
            }
            Err(err) => {
                debug!(%err, tag, "pipe read failed");
                break;
            }
        }
    }
}
