//! Control-plane listener.
//!
//! A single-threaded accept loop: one connection at a time, one message per
//! connection. Ingest requests become queue items; the first shutdown
//! request ends the loop after the handler has issued the drain. Malformed
//! messages and per-connection I/O errors are logged and never stop the loop.
//! Accept errors back off, and a long run of them ends the loop with
//! [`CoordinatorError::Listener`].

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use tracing::{error, info, info_span, warn};

use crate::error::CoordinatorError;
use crate::protocol::{ControlMessage, ControlProtocol};
use crate::queue::{QueueError, RawFileRef};

/// Receives classified control messages.
pub trait ControlHandler {
    /// A client asked to merge `raw`.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the work queue is gone.
    fn on_ingest(&mut self, raw: RawFileRef) -> Result<(), QueueError>;

    /// A client asked to stop. Called at most once per listener.
    ///
    /// # Errors
    /// Returns [`QueueError`] if the work queue is gone.
    fn on_shutdown(&mut self) -> Result<(), QueueError>;
}

/// Consecutive accept failures tolerated before the listener gives up.
const MAX_ACCEPT_FAILURES: u32 = 50;
/// Pause after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counts consecutive accept failures and sleeps between them.
#[derive(Debug)]
struct AcceptBackoff {
    failures: u32,
    limit: u32,
    delay: Duration,
}

impl AcceptBackoff {
    const fn new(limit: u32, delay: Duration) -> Self {
        Self {
            failures: 0,
            limit,
            delay,
        }
    }

    const fn succeeded(&mut self) {
        self.failures = 0;
    }

    /// Record a failed accept. Sleeps and returns `Ok` while under the
    /// limit; the failure that reaches it is returned as fatal.
    fn failed(&mut self, e: io::Error) -> Result<(), CoordinatorError> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.limit {
            error!(error = %e, failures = self.failures, "accept keeps failing, listener giving up");
            return Err(CoordinatorError::Listener(e));
        }
        warn!(error = %e, failures = self.failures, "accept failed, backing off");
        thread::sleep(self.delay);
        Ok(())
    }
}

/// Bound control socket.
#[derive(Debug)]
pub struct ControlListener {
    socket: TcpListener,
    protocol: ControlProtocol,
}

impl ControlListener {
    /// Bind `protocol.address`.
    ///
    /// # Errors
    /// [`CoordinatorError::Bind`] if the address cannot be bound.
    pub fn bind(protocol: ControlProtocol) -> Result<Self, CoordinatorError> {
        let socket =
            TcpListener::bind(protocol.address.as_str()).map_err(|source| CoordinatorError::Bind {
                address: protocol.address.clone(),
                source,
            })?;
        Ok(Self { socket, protocol })
    }

    /// Address actually bound (resolves port `0`).
    ///
    /// # Errors
    /// Returns the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Protocol with the address replaced by the bound one, for clients.
    ///
    /// # Errors
    /// Returns the socket error.
    pub fn client_protocol(&self) -> io::Result<ControlProtocol> {
        Ok(self
            .protocol
            .clone()
            .with_address(self.local_addr()?.to_string()))
    }

    /// Accept connections until a shutdown request arrives.
    ///
    /// Returns the number of ingest requests forwarded to `handler`.
    ///
    /// # Errors
    /// [`CoordinatorError::Queue`] if the handler lost its queue, or
    /// [`CoordinatorError::Listener`] once accepting has failed
    /// `MAX_ACCEPT_FAILURES` times in a row.
    pub fn serve(&self, handler: &mut impl ControlHandler) -> Result<usize, CoordinatorError> {
        let mut backoff = AcceptBackoff::new(MAX_ACCEPT_FAILURES, ACCEPT_RETRY_DELAY);
        let mut ingested = 0;
        info!(address = %self.describe_address(), "control listener accepting");
        for conn in self.socket.incoming() {
            let stream = match conn {
                Ok(stream) => {
                    backoff.succeeded();
                    stream
                }
                Err(e) => {
                    backoff.failed(e)?;
                    continue;
                }
            };
            match self.receive(&stream) {
                Some(ControlMessage::Ingest(raw)) => {
                    info!(file = %raw, stage = "ingest", "raw file queued");
                    handler.on_ingest(raw)?;
                    ingested += 1;
                }
                Some(ControlMessage::Shutdown) => {
                    info!(ingested, "shutdown requested, draining");
                    handler.on_shutdown()?;
                    return Ok(ingested);
                }
                None => {}
            }
        }
        // `incoming()` never yields `None`.
        Ok(ingested)
    }

    fn receive(&self, stream: &TcpStream) -> Option<ControlMessage> {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_owned(), |a| a.to_string());
        let _span = info_span!("control_connection", %peer).entered();
        if let Err(e) = stream.set_read_timeout(Some(self.protocol.read_timeout)) {
            warn!(error = %e, "could not set read timeout, dropping connection");
            return None;
        }
        match self.protocol.read_message(stream) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(error = %e, stage = "control", "malformed control message, connection closed");
                None
            }
        }
    }

    fn describe_address(&self) -> String {
        self.local_addr()
            .map_or_else(|_| self.protocol.address.clone(), |a| a.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::protocol::ControlClient;
    use std::io::Write as _;
    use std::path::Path;

    #[derive(Default)]
    struct Recorder {
        ingested: Vec<RawFileRef>,
        shutdowns: usize,
    }

    impl ControlHandler for Recorder {
        fn on_ingest(&mut self, raw: RawFileRef) -> Result<(), QueueError> {
            self.ingested.push(raw);
            Ok(())
        }

        fn on_shutdown(&mut self) -> Result<(), QueueError> {
            self.shutdowns += 1;
            Ok(())
        }
    }

    fn listener() -> ControlListener {
        ControlListener::bind(ControlProtocol {
            address: "127.0.0.1:0".to_owned(),
            sentinel: b"\0STOP\0".to_vec(),
            max_message_bytes: 256,
            read_timeout: Duration::from_millis(500),
            connect_retries: 5,
        })
        .unwrap()
    }

    #[test]
    fn ingests_until_shutdown_and_survives_garbage() {
        let listener = listener();
        let client = ControlClient::new(listener.client_protocol().unwrap());
        let addr = listener.local_addr().unwrap();

        let clients = thread::spawn(move || {
            client.send_ingest(Path::new("/r/a.profraw")).unwrap();
            // Raw garbage straight over TCP.
            let mut raw = TcpStream::connect(addr).unwrap();
            raw.write_all(&[0xff, 0xfe]).unwrap();
            drop(raw);
            // Connect and send nothing.
            drop(TcpStream::connect(addr).unwrap());
            client.send_ingest(Path::new("/r/b.profraw")).unwrap();
            client.send_shutdown().unwrap();
        });

        let mut recorder = Recorder::default();
        let ingested = listener.serve(&mut recorder).unwrap();
        clients.join().unwrap();

        assert_eq!(ingested, 2);
        assert_eq!(
            recorder.ingested,
            vec![RawFileRef::new("/r/a.profraw"), RawFileRef::new("/r/b.profraw")]
        );
        assert_eq!(recorder.shutdowns, 1);
    }

    #[test]
    fn stalled_client_times_out_without_blocking_others() {
        let listener = listener();
        let client = ControlClient::new(listener.client_protocol().unwrap());
        let addr = listener.local_addr().unwrap();

        let clients = thread::spawn(move || {
            // Holds its write half open past the read timeout.
            let mut stalled = TcpStream::connect(addr).unwrap();
            stalled.write_all(b"/r/partial").unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(stalled);
            client.send_shutdown().unwrap();
        });

        let mut recorder = Recorder::default();
        assert_eq!(listener.serve(&mut recorder).unwrap(), 0);
        clients.join().unwrap();
        assert!(recorder.ingested.is_empty());
    }

    #[test]
    fn accept_failures_back_off_then_give_up() {
        let mut backoff = AcceptBackoff::new(3, Duration::ZERO);
        let emfile = || io::Error::other("too many open files");
        assert!(backoff.failed(emfile()).is_ok());
        assert!(backoff.failed(emfile()).is_ok());
        let err = backoff.failed(emfile()).unwrap_err();
        assert!(matches!(err, CoordinatorError::Listener(_)));
        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn accept_success_resets_the_failure_run() {
        let mut backoff = AcceptBackoff::new(2, Duration::ZERO);
        for _ in 0..5 {
            assert!(backoff.failed(io::Error::other("transient")).is_ok());
            backoff.succeeded();
        }
    }

    #[test]
    fn accept_backoff_sleeps_between_failures() {
        let mut backoff = AcceptBackoff::new(10, Duration::from_millis(20));
        let started = std::time::Instant::now();
        backoff.failed(io::Error::other("transient")).unwrap();
        backoff.failed(io::Error::other("transient")).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn bind_conflict_is_reported() {
        let first = listener();
        let taken = first.local_addr().unwrap().to_string();
        let err = ControlListener::bind(first.protocol.clone().with_address(taken)).unwrap_err();
        assert!(matches!(err, CoordinatorError::Bind { .. }));
    }
}
