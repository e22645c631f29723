//! Wire protocol: requests, response frames, and the two framing layers.
//!
//! One payload is one frame. The first byte is a format tag:
//!
//! - [`FORMAT_JSON`] — the rest of the payload is a JSON document with a
//!   `kind` discriminator. All requests and all response frames except
//!   binary artifacts use this form.
//! - [`FORMAT_BINARY`] — a byte-stream frame laid out as
//!   `u8 stream-len | stream | u8 id-len | id | artifact bytes`, so image
//!   payloads cross the wire without being re-encoded.
//!
//! On the client↔broker socket the transport delimits frames (one frame per
//! ZeroMQ message part). On the broker↔worker pipe channel every frame is
//! prefixed with a big-endian `u32` length.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CillowError, Exception};

/// Format tag for JSON-structured frames.
pub const FORMAT_JSON: u8 = 0x00;
/// Format tag for binary artifact frames.
pub const FORMAT_BINARY: u8 = 0x01;

/// Upper bound on a single frame, shared by both framing layers.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Sentinel environment string for the ambient (system) runtime.
pub const SYSTEM_ENV: &str = "$system";

// ── Environment ──────────────────────────────────────────────────────────────

/// A runtime environment reference.
///
/// The sentinel `"$system"` denotes the ambient environment; any other value
/// is a directory holding a self-contained environment. Directory references
/// are normalized to absolute paths so that two spellings of the same
/// directory pool onto the same worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Environment {
    System,
    Dir(PathBuf),
}

impl Environment {
    pub fn parse(raw: &str) -> Self {
        if raw == SYSTEM_ENV {
            return Environment::System;
        }
        let path = Path::new(raw);
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        Environment::Dir(absolute)
    }

    /// The wire spelling of this environment.
    pub fn as_wire(&self) -> String {
        match self {
            Environment::System => SYSTEM_ENV.to_string(),
            Environment::Dir(path) => path.to_string_lossy().into_owned(),
        }
    }

    /// Directory that installed packages land in, if this is a directory
    /// environment.
    pub fn site_packages(&self) -> Option<PathBuf> {
        match self {
            Environment::System => None,
            Environment::Dir(path) => Some(path.join("site-packages")),
        }
    }

    /// Directory prepended to `PATH` inside workers bound to this
    /// environment.
    pub fn bin_dir(&self) -> Option<PathBuf> {
        match self {
            Environment::System => None,
            Environment::Dir(path) => Some(path.join("bin")),
        }
    }
}

impl Serialize for Environment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_wire())
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Environment::parse(&raw))
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

/// A client request, dispatched by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    RunCode {
        env: Environment,
        source: String,
    },
    RunCommand {
        env: Environment,
        argv: Vec<String>,
    },
    InstallRequirements {
        env: Environment,
        names: Vec<String>,
    },
    SetEnvVars {
        env: Environment,
        vars: BTreeMap<String, String>,
    },
    SwitchInterpreter {
        env: Environment,
    },
    DeleteInterpreter {
        env: Environment,
    },
    ShutdownClient,
}

impl Request {
    /// The environment this request targets, if any.
    pub fn env(&self) -> Option<&Environment> {
        match self {
            Request::RunCode { env, .. }
            | Request::RunCommand { env, .. }
            | Request::InstallRequirements { env, .. }
            | Request::SetEnvVars { env, .. }
            | Request::SwitchInterpreter { env }
            | Request::DeleteInterpreter { env } => Some(env),
            Request::ShutdownClient => None,
        }
    }
}

// ── Response frames ──────────────────────────────────────────────────────────

/// One frame of a request's response stream.
///
/// Every request produces zero or more `Stream`/`ByteStream` frames, then at
/// most one of `Result`/`Exception`, then exactly one `End`. `Ready` exists
/// only on the broker↔worker channel and is never relayed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseFrame {
    Ready,
    Stream {
        stream: String,
        text: String,
    },
    ByteStream {
        stream: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        bytes: Vec<u8>,
    },
    Result {
        #[serde(default)]
        value: serde_json::Value,
    },
    Exception(Exception),
    End,
}

impl ResponseFrame {
    pub fn stream(stream: impl Into<String>, text: impl Into<String>) -> Self {
        ResponseFrame::Stream {
            stream: stream.into(),
            text: text.into(),
        }
    }

    /// `true` for the frame that completes a request.
    pub fn is_end(&self) -> bool {
        matches!(self, ResponseFrame::End)
    }
}

// ── Payload encoding ─────────────────────────────────────────────────────────

/// Encode a response frame into a single self-describing payload.
pub fn encode_frame(frame: &ResponseFrame) -> Result<Vec<u8>, CillowError> {
    match frame {
        ResponseFrame::ByteStream { stream, id, bytes } => {
            let stream_bytes = stream.as_bytes();
            let id_bytes = id.as_deref().unwrap_or("").as_bytes();
            if stream_bytes.len() > u8::MAX as usize || id_bytes.len() > u8::MAX as usize {
                return Err(CillowError::MalformedFrame(
                    "byte-stream tag or id longer than 255 bytes".to_string(),
                ));
            }
            let mut buf =
                Vec::with_capacity(3 + stream_bytes.len() + id_bytes.len() + bytes.len());
            buf.push(FORMAT_BINARY);
            buf.push(stream_bytes.len() as u8);
            buf.extend_from_slice(stream_bytes);
            buf.push(id_bytes.len() as u8);
            buf.extend_from_slice(id_bytes);
            buf.extend_from_slice(bytes);
            Ok(buf)
        }
        other => {
            let mut buf = vec![FORMAT_JSON];
            serde_json::to_writer(&mut buf, other)?;
            Ok(buf)
        }
    }
}

/// Decode a response-frame payload produced by [`encode_frame`].
pub fn decode_frame(payload: &[u8]) -> Result<ResponseFrame, CillowError> {
    match payload.first().copied() {
        Some(FORMAT_JSON) => Ok(serde_json::from_slice(&payload[1..])?),
        Some(FORMAT_BINARY) => {
            let mut cursor = &payload[1..];
            let stream = read_short_string(&mut cursor)?;
            let id = read_short_string(&mut cursor)?;
            Ok(ResponseFrame::ByteStream {
                stream,
                id: if id.is_empty() { None } else { Some(id) },
                bytes: cursor.to_vec(),
            })
        }
        Some(tag) => Err(CillowError::MalformedFrame(format!(
            "unknown format tag 0x{tag:02x}"
        ))),
        None => Err(CillowError::MalformedFrame("empty payload".to_string())),
    }
}

/// Encode a request payload (always the structured form).
pub fn encode_request(request: &Request) -> Result<Vec<u8>, CillowError> {
    let mut buf = vec![FORMAT_JSON];
    serde_json::to_writer(&mut buf, request)?;
    Ok(buf)
}

/// Decode a request payload.
pub fn decode_request(payload: &[u8]) -> Result<Request, CillowError> {
    match payload.first().copied() {
        Some(FORMAT_JSON) => Ok(serde_json::from_slice(&payload[1..])?),
        Some(tag) => Err(CillowError::MalformedFrame(format!(
            "requests must use the structured form, got tag 0x{tag:02x}"
        ))),
        None => Err(CillowError::MalformedFrame("empty payload".to_string())),
    }
}

fn read_short_string(cursor: &mut &[u8]) -> Result<String, CillowError> {
    let len = *cursor
        .first()
        .ok_or_else(|| CillowError::MalformedFrame("truncated byte-stream frame".to_string()))?
        as usize;
    if cursor.len() < 1 + len {
        return Err(CillowError::MalformedFrame(
            "truncated byte-stream frame".to_string(),
        ));
    }
    let text = String::from_utf8_lossy(&cursor[1..1 + len]).into_owned();
    *cursor = &cursor[1 + len..];
    Ok(text)
}

// ── Pipe framing (broker↔worker channel) ─────────────────────────────────────

/// Read one length-prefixed frame from a blocking reader.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
pub fn read_frame_buf<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, CillowError> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(CillowError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame to a blocking writer.
pub fn write_frame_buf<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), CillowError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(CillowError::FrameTooLarge(payload.len()));
    }
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Async counterpart of [`read_frame_buf`], used on the broker side of the
/// worker channel.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, CillowError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(CillowError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Async counterpart of [`write_frame_buf`].
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), CillowError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(CillowError::FrameTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// ── Frame sink ───────────────────────────────────────────────────────────────

/// Shared handle that serializes response frames onto the worker's output
/// channel.
///
/// Cheap to clone; all clones write through one mutex so frames emitted by
/// capture hooks, the installer, and the dispatch loop interleave whole, in
/// the order they were produced.
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl FrameSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Emit one frame, length-prefixed and flushed.
    pub fn emit(&self, frame: &ResponseFrame) -> Result<(), CillowError> {
        let payload = encode_frame(frame)?;
        let mut writer = self.inner.lock().expect("frame sink poisoned");
        write_frame_buf(&mut *writer, &payload)?;
        writer.flush()?;
        Ok(())
    }

    /// Emit a textual stream chunk.
    pub fn stream(&self, stream: &str, text: &str) -> Result<(), CillowError> {
        self.emit(&ResponseFrame::stream(stream, text))
    }

    /// Emit a binary artifact.
    pub fn byte_stream(
        &self,
        stream: &str,
        id: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<(), CillowError> {
        self.emit(&ResponseFrame::ByteStream {
            stream: stream.to_string(),
            id,
            bytes,
        })
    }
}
