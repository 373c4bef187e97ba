//! WebSocket client connections and their receiver threads
//!
//! Plain `ws://` over a blocking `TcpStream`. The receiver thread reads
//! with a short socket timeout so it notices cancellation within one poll
//! interval, and forwards frames to the adapter queue through a
//! `QueueProducer`, which guarantees a final `Close`.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_policy::CancellationToken;
use tungstenite::{Message, WebSocket};
use url::Url;

use crate::adapter::{ProducerSet, POLL_INTERVAL};
use crate::sync::MutexExt;
use crate::transport::{QueueProducer, TransportError};

/// Network errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),
    #[error("Unsupported scheme '{0}' (only ws:// is available)")]
    UnsupportedScheme(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Connection is closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Could not start receiver: {0}")]
    Spawn(String),
}

struct WsShared {
    socket: Mutex<WebSocket<TcpStream>>,
    open: AtomicBool,
    url: String,
    peer: String,
}

/// One client connection
pub struct WsConnection {
    shared: Arc<WsShared>,
    receiver: Mutex<Option<CancellationToken>>,
}

impl WsConnection {
    /// Open the TCP connection and run the client handshake
    pub fn connect(url: &str, timeout: Duration) -> Result<Self, NetError> {
        let parsed = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "ws" => {}
            other => return Err(NetError::UnsupportedScheme(other.to_string())),
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| NetError::InvalidUrl(format!("'{url}' has no host")))?;
        let port = parsed.port_or_known_default().unwrap_or(80);

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| NetError::Connect(format!("{host}:{port}: {e}")))?;
        let mut last_error = format!("{host}:{port}: no addresses");
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = format!("{addr}: {e}"),
            }
        }
        let stream = stream.ok_or(NetError::Connect(last_error))?;

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let _ = stream.set_nodelay(true);
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| NetError::Connect(e.to_string()))?;

        let (socket, _response) =
            tungstenite::client(url, stream).map_err(|e| NetError::Handshake(e.to_string()))?;

        // From here on reads must time out quickly so the receiver can poll
        socket
            .get_ref()
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|e| NetError::Connect(e.to_string()))?;

        tracing::debug!(%url, %peer, "WebSocket connected");
        Ok(Self {
            shared: Arc::new(WsShared {
                socket: Mutex::new(socket),
                open: AtomicBool::new(true),
                url: url.to_string(),
                peer,
            }),
            receiver: Mutex::new(None),
        })
    }

    /// Start the receiver thread that feeds `producer`
    pub fn start_receiver(
        &self,
        producers: &ProducerSet,
        producer: QueueProducer,
    ) -> Result<(), NetError> {
        let shared = self.shared.clone();
        let label = format!("ws-{}", producer.source().index());
        let token = producers
            .spawn(label, move |token| receive_loop(&shared, &producer, &token))
            .map_err(|e| NetError::Spawn(e.to_string()))?;
        *self.receiver.lock_or_recover() = Some(token);
        Ok(())
    }

    /// Send a frame: text when the payload is UTF-8, binary otherwise
    pub fn send(&self, payload: &[u8]) -> Result<(), NetError> {
        if !self.is_open() {
            return Err(NetError::Closed);
        }
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.to_string()),
            Err(_) => Message::Binary(payload.to_vec()),
        };
        self.shared
            .socket
            .lock_or_recover()
            .send(message)
            .map_err(|e| NetError::Send(e.to_string()))
    }

    /// Ask the receiver to send a close frame and stop
    pub fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            tracing::debug!(url = %self.shared.url, "WebSocket closing");
        }
        match self.receiver.lock_or_recover().as_ref() {
            Some(token) => token.cancel(),
            None => close_socket(&self.shared),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn peer_addr(&self) -> &str {
        &self.shared.peer
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn close_socket(shared: &WsShared) {
    let mut socket = shared.socket.lock_or_recover();
    let _ = socket.close(None);
    let _ = socket.flush();
}

fn receive_loop(shared: &WsShared, producer: &QueueProducer, token: &CancellationToken) {
    let source = producer.source();
    loop {
        if token.is_cancelled() {
            close_socket(shared);
            break;
        }

        let frame = shared.socket.lock_or_recover().read();
        let pushed = match frame {
            Ok(Message::Text(text)) => producer.message(text.into_bytes()),
            Ok(Message::Binary(data)) => producer.message(data),
            Ok(Message::Close(frame)) => {
                tracing::debug!(%source, ?frame, "Peer closed WebSocket");
                // Send the queued close reply
                let _ = shared.socket.lock_or_recover().flush();
                break;
            }
            Ok(_) => Ok(()),
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(())
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(e) => {
                let _ = producer.error(e.to_string());
                break;
            }
        };

        match pushed {
            Ok(()) => {}
            Err(TransportError::Full) => {
                tracing::warn!(%source, "WebSocket message dropped, queue full");
            }
            Err(e) => {
                tracing::debug!(%source, error = %e, "WebSocket queue gone");
                close_socket(shared);
                break;
            }
        }
    }

    shared.open.store(false, Ordering::SeqCst);
    producer.close();
    tracing::debug!(%source, "WebSocket receiver stopped");
}
