//! Elevation pipe wire protocol
//!
//! Frames are `{u32 type, u32 length, payload}`, little endian; the payload is
//! the message body encoded with postcard. Any reliable byte stream works: the
//! companion's stdio in production, a Unix socket pair in tests.
//!
//! A dedicated reader thread decodes frames into a queue; `recv` waits on the
//! queue with the configured timeout. Closure of the stream reads as
//! `Terminate { abort: true }`.

use crate::error::{BurnError, HResult, Result};
use crate::package::invocation::Restart;
use crate::types::ActionState;
use crate::variables::Variant;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Bumped whenever a message layout changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeMessage {
    /// First message from the companion
    Connect { secret: String, protocol_version: u32 },
    /// Parent -> companion: run one package action
    ExecutePackage {
        package_id: String,
        action: ActionState,
        rollback: bool,
    },
    /// Companion -> parent while a package runs
    Progress { percent: u8 },
    /// Parent -> companion: the UX's answer to a Progress message
    ProgressReply { cancel: bool },
    GetPriorVariableNumeric { name: String },
    GetPriorVariableString { name: String },
    GetPriorVariableVersion { name: String },
    /// Reply to a GetPriorVariable* request; `None` when unset
    VariableResult { value: Option<Variant>, hidden: bool },
    /// Final reply to ExecutePackage or Terminate
    Complete { hresult: HResult, restart: Restart },
    /// Parent -> companion: end the session
    Terminate { abort: bool },
}

impl PipeMessage {
    pub const fn type_id(&self) -> u32 {
        match self {
            Self::Connect { .. } => 1,
            Self::ExecutePackage { .. } => 2,
            Self::Progress { .. } => 3,
            Self::GetPriorVariableNumeric { .. } => 4,
            Self::GetPriorVariableString { .. } => 5,
            Self::GetPriorVariableVersion { .. } => 6,
            Self::VariableResult { .. } => 7,
            Self::Complete { .. } => 8,
            Self::Terminate { .. } => 9,
            Self::ProgressReply { .. } => 10,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "Connect",
            Self::ExecutePackage { .. } => "ExecutePackage",
            Self::Progress { .. } => "Progress",
            Self::GetPriorVariableNumeric { .. } => "GetPriorVariableNumeric",
            Self::GetPriorVariableString { .. } => "GetPriorVariableString",
            Self::GetPriorVariableVersion { .. } => "GetPriorVariableVersion",
            Self::VariableResult { .. } => "VariableResult",
            Self::Complete { .. } => "Complete",
            Self::Terminate { .. } => "Terminate",
            Self::ProgressReply { .. } => "ProgressReply",
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Connect {
                secret,
                protocol_version,
            } => postcard::to_stdvec(&(secret, protocol_version))?,
            Self::ExecutePackage {
                package_id,
                action,
                rollback,
            } => postcard::to_stdvec(&(package_id, action, rollback))?,
            Self::Progress { percent } => postcard::to_stdvec(percent)?,
            Self::GetPriorVariableNumeric { name }
            | Self::GetPriorVariableString { name }
            | Self::GetPriorVariableVersion { name } => postcard::to_stdvec(name)?,
            Self::VariableResult { value, hidden } => postcard::to_stdvec(&(value, hidden))?,
            Self::Complete { hresult, restart } => postcard::to_stdvec(&(hresult, restart))?,
            Self::Terminate { abort } => postcard::to_stdvec(abort)?,
            Self::ProgressReply { cancel } => postcard::to_stdvec(cancel)?,
        };
        Ok(bytes)
    }

    /// Encode as one frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload()?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| BurnError::communication(format!("{} frame too large", self.name())))?;

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&self.type_id().to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a frame body of the given type.
    pub fn decode(type_id: u32, payload: &[u8]) -> Result<Self> {
        fn body<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
            Ok(postcard::from_bytes(payload)?)
        }

        let message = match type_id {
            1 => {
                let (secret, protocol_version) = body(payload)?;
                Self::Connect {
                    secret,
                    protocol_version,
                }
            }
            2 => {
                let (package_id, action, rollback) = body(payload)?;
                Self::ExecutePackage {
                    package_id,
                    action,
                    rollback,
                }
            }
            3 => Self::Progress {
                percent: body(payload)?,
            },
            4 => Self::GetPriorVariableNumeric { name: body(payload)? },
            5 => Self::GetPriorVariableString { name: body(payload)? },
            6 => Self::GetPriorVariableVersion { name: body(payload)? },
            7 => {
                let (value, hidden) = body(payload)?;
                Self::VariableResult { value, hidden }
            }
            8 => {
                let (hresult, restart) = body(payload)?;
                Self::Complete { hresult, restart }
            }
            9 => Self::Terminate {
                abort: body(payload)?,
            },
            10 => Self::ProgressReply {
                cancel: body(payload)?,
            },
            other => {
                return Err(BurnError::communication(format!(
                    "unknown pipe message type {}",
                    other
                )));
            }
        };
        Ok(message)
    }
}

/// Read one frame; `Ok(None)` on clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<PipeMessage>> {
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let type_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(BurnError::communication(format!(
            "frame of {} bytes exceeds the limit",
            len
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    PipeMessage::decode(type_id, &payload).map(Some)
}

pub fn write_frame<W: Write>(writer: &mut W, message: &PipeMessage) -> Result<()> {
    writer.write_all(&message.encode()?)?;
    writer.flush()?;
    Ok(())
}

/// One end of an elevation pipe.
pub struct Pipe {
    writer: Box<dyn Write + Send>,
    incoming: Receiver<Result<PipeMessage>>,
    timeout: Duration,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl Pipe {
    pub fn new<R, W>(reader: R, writer: W, timeout: Duration) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, incoming) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("burn-pipe-reader".into())
            .spawn(move || {
                let mut reader = io::BufReader::new(reader);
                loop {
                    match read_frame(&mut reader) {
                        Ok(Some(message)) => {
                            if tx.send(Ok(message)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
                tracing::debug!("Pipe reader finished");
            })?;

        Ok(Self {
            writer: Box::new(writer),
            incoming,
            timeout,
            reader: Some(handle),
            closed: false,
        })
    }

    pub fn send(&mut self, message: &PipeMessage) -> Result<()> {
        tracing::trace!("pipe send {}", message.name());
        write_frame(&mut self.writer, message)
            .map_err(|e| BurnError::communication(format!("sending {}: {}", message.name(), e)))
    }

    /// Next message. Timeout is a CommunicationError; a closed stream reads
    /// as `Terminate { abort: true }`.
    pub fn recv(&mut self) -> Result<PipeMessage> {
        if self.closed {
            return Ok(PipeMessage::Terminate { abort: true });
        }
        match self.incoming.recv_timeout(self.timeout) {
            Ok(Ok(message)) => {
                tracing::trace!("pipe recv {}", message.name());
                Ok(message)
            }
            Ok(Err(e)) => Err(BurnError::communication(format!("reading pipe: {}", e))),
            Err(RecvTimeoutError::Timeout) => Err(BurnError::communication(format!(
                "no reply within {}s",
                self.timeout.as_secs()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                Ok(PipeMessage::Terminate { abort: true })
            }
        }
    }

    /// Wait for the next message with no deadline. Used by the companion
    /// between commands, when the parent may be busy in UX callbacks.
    pub fn recv_idle(&mut self) -> Result<PipeMessage> {
        if self.closed {
            return Ok(PipeMessage::Terminate { abort: true });
        }
        match self.incoming.recv() {
            Ok(Ok(message)) => {
                tracing::trace!("pipe recv {}", message.name());
                Ok(message)
            }
            Ok(Err(e)) => Err(BurnError::communication(format!("reading pipe: {}", e))),
            Err(_) => {
                self.closed = true;
                Ok(PipeMessage::Terminate { abort: true })
            }
        }
    }

    /// Send `request` and wait for the next message.
    pub fn request(&mut self, request: &PipeMessage) -> Result<PipeMessage> {
        self.send(request)?;
        self.recv()
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // The reader exits at end of stream; do not block on a peer that
        // keeps its end open.
        if let Some(handle) = self.reader.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}
