//! The driver/init synchronization protocol.
//!
//! Both sides share one Unix socket pair. Messages are JSON objects, one per
//! line. The exchange is:
//!
//! 1. driver → init: `bootstrap` carrying the spec and the target process
//! 2. driver → init: `setup_complete` once ID maps and cgroup are in place
//! 3. init → driver: `ready` right before exec, or `error` at any stage
//! 4. init → driver: EOF when exec succeeds (the socket is close-on-exec),
//!    or `error` when it fails

use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use runf_core::process::ProcessArgs;
use runf_core::spec::IsolationSpec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the init process needs from the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    /// The container's isolation spec.
    pub spec: IsolationSpec,
    /// The command to exec once isolation is in place.
    pub process: ProcessArgs,
}

/// The init step a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStage {
    /// Receiving the bootstrap or the setup notification.
    Handshake,
    /// Becoming root in the user namespace and isolating mounts.
    Namespaces,
    /// Mounts, devices, `pivot_root`, masked and read-only paths.
    Rootfs,
    /// Setting the UTS hostname.
    Hostname,
    /// Applying rlimits.
    Rlimits,
    /// Resolving the target user.
    User,
    /// Switching credentials and capability sets.
    Credentials,
    /// Setting no-new-privileges.
    NoNewPrivileges,
    /// Executing the target.
    Exec,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshake => "handshake",
            Self::Namespaces => "namespace entry",
            Self::Rootfs => "rootfs preparation",
            Self::Hostname => "hostname",
            Self::Rlimits => "rlimits",
            Self::User => "user resolution",
            Self::Credentials => "credentials",
            Self::NoNewPrivileges => "no-new-privileges",
            Self::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Driver → init: what to run and how to isolate it.
    Bootstrap {
        /// Spec and process.
        config: Box<InitConfig>,
    },
    /// Driver → init: host-side setup for the init pid is done.
    SetupComplete,
    /// Init → driver: isolation is in place, exec comes next.
    Ready,
    /// Init → driver: a stage failed.
    Error {
        /// The failing stage.
        stage: InitStage,
        /// Description of the failure.
        message: String,
    },
}

impl SyncMessage {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Bootstrap { .. } => "bootstrap",
            Self::SetupComplete => "setup_complete",
            Self::Ready => "ready",
            Self::Error { .. } => "error",
        }
    }
}

/// Failure on the sync channel.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Reading or writing the socket failed.
    #[error("sync socket I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A message could not be encoded or decoded.
    #[error("malformed sync message: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer sent a message out of order or closed the socket early.
    #[error("expected {expected}, got {got}")]
    Unexpected {
        /// The message the protocol required.
        expected: &'static str,
        /// What arrived instead.
        got: String,
    },
}

impl HandshakeError {
    /// Builds an [`HandshakeError::Unexpected`] from what was received.
    #[must_use]
    pub fn unexpected(expected: &'static str, got: Option<&SyncMessage>) -> Self {
        Self::Unexpected {
            expected,
            got: got.map_or_else(|| "end of stream".to_owned(), |m| m.kind().to_owned()),
        }
    }
}

/// One end of the sync socket.
#[derive(Debug)]
pub struct SyncChannel {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl SyncChannel {
    /// Wraps a connected socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be duplicated.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Creates a connected pair: the driver's channel and the raw socket
    /// handed to init.
    ///
    /// # Errors
    ///
    /// Returns an error if `socketpair(2)` fails.
    pub fn pair() -> io::Result<(Self, UnixStream)> {
        let (driver, init) = UnixStream::pair()?;
        Ok((Self::new(driver)?, init))
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn send(&mut self, message: &SyncMessage) -> Result<(), HandshakeError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        tracing::trace!(message = message.kind(), "sync message sent");
        Ok(())
    }

    /// Receives one message, or `None` once the peer has closed its end.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub fn recv(&mut self) -> Result<Option<SyncMessage>, HandshakeError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let message: SyncMessage = serde_json::from_str(line.trim_end())?;
        tracing::trace!(message = message.kind(), "sync message received");
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_by_type() {
        let json = serde_json::to_string(&SyncMessage::SetupComplete).unwrap();
        assert_eq!(json, r#"{"type":"setup_complete"}"#);

        let error = SyncMessage::Error {
            stage: InitStage::Rootfs,
            message: "boom".into(),
        };
        let json = serde_json::to_string(&error).unwrap();
        assert_eq!(json, r#"{"type":"error","stage":"rootfs","message":"boom"}"#);
    }

    #[test]
    fn channel_delivers_in_order_then_eof() {
        let (mut driver, init) = SyncChannel::pair().unwrap();
        let mut init = SyncChannel::new(init).unwrap();

        driver.send(&SyncMessage::SetupComplete).unwrap();
        driver.send(&SyncMessage::Ready).unwrap();
        assert_eq!(init.recv().unwrap(), Some(SyncMessage::SetupComplete));
        assert_eq!(init.recv().unwrap(), Some(SyncMessage::Ready));

        drop(driver);
        assert_eq!(init.recv().unwrap(), None);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let (driver, init) = SyncChannel::pair().unwrap();
        let mut driver = driver;
        let mut raw = init;
        raw.write_all(b"not json\n").unwrap();
        assert!(matches!(driver.recv(), Err(HandshakeError::Codec(_))));
    }

    #[test]
    fn unexpected_eof_is_described() {
        let err = HandshakeError::unexpected("ready", None);
        assert_eq!(err.to_string(), "expected ready, got end of stream");
    }
}
