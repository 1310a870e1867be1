//! Control-plane wire contract shared by the listener and its clients.
//!
//! One message per TCP connection. The client writes the payload and shuts
//! down its write half; the server reads to EOF. A payload equal to the
//! shutdown sentinel requests a drain; any other well-formed payload is the
//! path of a raw file to ingest.
//!
//! The sentinel defaults to a string wrapped in NUL bytes. No filesystem path
//! can contain NUL, so classification never confuses the two shapes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::queue::RawFileRef;

/// Pause between client connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// ControlProtocol
// ---------------------------------------------------------------------------

/// Address, framing limits, and sentinel agreed by both roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlProtocol {
    /// `host:port` the listener binds and clients connect to.
    pub address: String,
    /// Exact payload of a shutdown request.
    pub sentinel: Vec<u8>,
    /// Largest payload a listener accepts.
    pub max_message_bytes: usize,
    /// Listener-side read timeout per connection.
    pub read_timeout: Duration,
    /// Client connect attempts before reporting [`ProtocolError::NotListening`].
    pub connect_retries: u32,
}

impl ControlProtocol {
    /// Same contract, different address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Read one whole message from `reader` and classify it.
    ///
    /// Reads at most `max_message_bytes + 1` bytes so an oversized sender
    /// cannot make the listener buffer without bound.
    ///
    /// # Errors
    /// Returns [`MalformedMessage`] if the payload is not a valid message or
    /// the read failed.
    pub fn read_message(&self, reader: impl Read) -> Result<ControlMessage, MalformedMessage> {
        let limit = u64::try_from(self.max_message_bytes)
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        let mut payload = Vec::new();
        reader
            .take(limit)
            .read_to_end(&mut payload)
            .map_err(MalformedMessage::Io)?;
        self.classify(&payload)
    }

    /// Classify a complete payload.
    ///
    /// A single trailing newline is ignored, so `echo path | nc` works.
    ///
    /// # Errors
    /// Returns [`MalformedMessage`] for empty, oversized, non-UTF-8, or
    /// NUL-containing payloads that are not the sentinel.
    pub fn classify(&self, payload: &[u8]) -> Result<ControlMessage, MalformedMessage> {
        if payload.len() > self.max_message_bytes {
            return Err(MalformedMessage::TooLarge {
                limit: self.max_message_bytes,
            });
        }
        let trimmed = strip_line_ending(payload);
        if payload == self.sentinel.as_slice() || trimmed == self.sentinel.as_slice() {
            return Ok(ControlMessage::Shutdown);
        }
        if trimmed.is_empty() {
            return Err(MalformedMessage::Empty);
        }
        let text = std::str::from_utf8(trimmed).map_err(|_| MalformedMessage::NotUtf8)?;
        if text.contains('\0') {
            return Err(MalformedMessage::InteriorNul);
        }
        Ok(ControlMessage::Ingest(RawFileRef::new(text)))
    }
}

fn strip_line_ending(payload: &[u8]) -> &[u8] {
    let payload = payload.strip_suffix(b"\n").unwrap_or(payload);
    payload.strip_suffix(b"\r").unwrap_or(payload)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A well-formed control message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Merge this raw file.
    Ingest(RawFileRef),
    /// Stop accepting and drain the pool.
    Shutdown,
}

/// Why a received payload was rejected. Logged by the listener, never fatal.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    /// The client closed the connection without sending anything.
    #[error("empty message")]
    Empty,
    /// The payload exceeded the configured limit.
    #[error("message larger than {limit} bytes")]
    TooLarge {
        /// The configured `max_message_bytes`.
        limit: usize,
    },
    /// The payload is neither the sentinel nor UTF-8 text.
    #[error("message is not valid UTF-8")]
    NotUtf8,
    /// A path cannot contain NUL.
    #[error("message contains a NUL byte but is not the shutdown sentinel")]
    InteriorNul,
    /// Reading the connection failed (timeout, reset).
    #[error("read failed: {0}")]
    Io(#[source] io::Error),
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Nothing accepted a connection at the address.
    #[error(
        "no coordinator listening on {address}: {source}\n  \
         To fix: start one with `profmerge start`, or check `[control] address` in profmerge.toml."
    )]
    NotListening {
        /// Address that refused the connection.
        address: String,
        /// Last connect error.
        #[source]
        source: io::Error,
    },

    /// The payload would be rejected by the listener.
    #[error("message of {len} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Writing the message failed after connecting.
    #[error("control connection failed: {0}")]
    Io(#[from] io::Error),
}

/// Sends ingest and shutdown requests to a running coordinator.
#[derive(Clone, Debug)]
pub struct ControlClient {
    protocol: ControlProtocol,
}

impl ControlClient {
    /// Create a client for the given contract.
    #[must_use]
    pub const fn new(protocol: ControlProtocol) -> Self {
        Self { protocol }
    }

    /// The contract this client speaks.
    #[must_use]
    pub const fn protocol(&self) -> &ControlProtocol {
        &self.protocol
    }

    /// Ask the coordinator to merge `raw`.
    ///
    /// The path is sent as given; pass an absolute path, since the
    /// coordinator resolves relative paths against its own working directory.
    ///
    /// # Errors
    /// See [`ProtocolError`].
    pub fn send_ingest(&self, raw: &Path) -> Result<(), ProtocolError> {
        self.send(raw.to_string_lossy().as_bytes())
    }

    /// Ask the coordinator to stop accepting and drain.
    ///
    /// # Errors
    /// See [`ProtocolError`].
    pub fn send_shutdown(&self) -> Result<(), ProtocolError> {
        self.send(&self.protocol.sentinel)
    }

    fn send(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        if payload.len() > self.protocol.max_message_bytes {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                limit: self.protocol.max_message_bytes,
            });
        }
        let mut stream = self.connect()?;
        stream.write_all(payload)?;
        stream.flush()?;
        stream.shutdown(Shutdown::Write)?;
        Ok(())
    }

    fn connect(&self) -> Result<TcpStream, ProtocolError> {
        let attempts = self.protocol.connect_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match TcpStream::connect(self.protocol.address.as_str()) {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < attempts && is_transient(&e) => {
                    debug!(address = %self.protocol.address, attempt, error = %e, "control connect retry");
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(ProtocolError::NotListening {
                        address: self.protocol.address.clone(),
                        source: e,
                    });
                }
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn protocol() -> ControlProtocol {
        ControlProtocol {
            address: "127.0.0.1:0".to_owned(),
            sentinel: b"\0STOP\0".to_vec(),
            max_message_bytes: 64,
            read_timeout: Duration::from_secs(1),
            connect_retries: 1,
        }
    }

    #[test]
    fn sentinel_is_shutdown() {
        let p = protocol();
        assert_eq!(p.classify(b"\0STOP\0").unwrap(), ControlMessage::Shutdown);
        assert_eq!(p.classify(b"\0STOP\0\n").unwrap(), ControlMessage::Shutdown);
    }

    #[test]
    fn path_is_ingest() {
        let p = protocol();
        assert_eq!(
            p.classify(b"/tmp/a.profraw\n").unwrap(),
            ControlMessage::Ingest(RawFileRef::new("/tmp/a.profraw"))
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let p = protocol();
        assert!(matches!(p.classify(b""), Err(MalformedMessage::Empty)));
        assert!(matches!(p.classify(b"\n"), Err(MalformedMessage::Empty)));
        assert!(matches!(
            p.classify(&[0xff, 0xfe, b'a']),
            Err(MalformedMessage::NotUtf8)
        ));
        assert!(matches!(
            p.classify(b"\0STOP"),
            Err(MalformedMessage::InteriorNul)
        ));
        assert!(matches!(
            p.classify(&[b'a'; 65]),
            Err(MalformedMessage::TooLarge { limit: 64 })
        ));
    }

    #[test]
    fn read_message_stops_past_limit() {
        let p = protocol();
        let big = vec![b'x'; 10_000];
        assert!(matches!(
            p.read_message(big.as_slice()),
            Err(MalformedMessage::TooLarge { .. })
        ));
    }

    #[test]
    fn client_refuses_oversized_payload_without_connecting() {
        let client = ControlClient::new(protocol());
        let long = "a".repeat(100);
        let err = client.send_ingest(Path::new(&long)).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { len: 100, limit: 64 }));
    }

    #[test]
    fn client_reports_not_listening() {
        // Bind then drop to get a port nothing listens on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let client = ControlClient::new(protocol().with_address(addr.to_string()));
        let err = client.send_shutdown().unwrap_err();
        assert!(matches!(err, ProtocolError::NotListening { .. }));
        assert!(err.to_string().contains("To fix"));
    }

    #[test]
    fn client_message_round_trips_through_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let p = protocol().with_address(listener.local_addr().unwrap().to_string());
        let client = ControlClient::new(p.clone());

        let sender = thread::spawn(move || client.send_ingest(Path::new("/data/x.profraw")));
        let (stream, _) = listener.accept().unwrap();
        let msg = p.read_message(stream).unwrap();
        sender.join().unwrap().unwrap();

        assert_eq!(msg, ControlMessage::Ingest(RawFileRef::new("/data/x.profraw")));
    }
}
