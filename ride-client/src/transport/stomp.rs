//! STOMP 1.2 over WebSocket.
//!
//! The socket is split into a sink (behind a mutex, used by every outbound
//! call) and a stream owned by a read-pump task. The pump decodes MESSAGE
//! frames and forwards them over an mpsc channel; `recv()` reads that
//! channel, which keeps it cancel-safe.

use super::{Frame, SubscriptionId, Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// How long to wait for the broker's CONNECTED frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered inbound messages between the pump and `recv()`.
const INBOUND_CAPACITY: usize = 256;

/// A decoded STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    /// Command (CONNECT, SUBSCRIBE, MESSAGE, ...).
    pub command: String,
    /// Headers in wire order.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: String,
}

impl StompFrame {
    /// Frame with no headers and an empty body.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the body.
    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    /// First value of a header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Encode to the wire form, NUL-terminated.
    ///
    /// CONNECT frames are not escaped, per STOMP 1.2.
    pub fn encode(&self) -> String {
        let escape = self.command != "CONNECT";
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Decode one frame. Returns `Ok(None)` for a heart-beat (bare EOLs).
    pub fn decode(raw: &str) -> Result<Option<Self>, TransportError> {
        let raw = raw.trim_start_matches(['\r', '\n']);
        if raw.is_empty() {
            return Ok(None);
        }
        let raw = raw.strip_suffix('\0').unwrap_or(raw);

        let (head, body) = match raw.find("\n\n") {
            Some(split) => (&raw[..split], &raw[split + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(split) => (&raw[..split], &raw[split + 4..]),
                None => (raw, ""),
            },
        };

        let mut lines = head.lines();
        let command = lines
            .next()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .ok_or_else(|| TransportError::Protocol("frame without command".into()))?;

        let escaped = command != "CONNECTED";
        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TransportError::Protocol(format!("malformed header: {line}")))?;
            if escaped {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Self {
            command: command.to_string(),
            headers,
            body: body.to_string(),
        };
        if let Some(length) = frame.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            if length <= frame.body.len() && frame.body.is_char_boundary(length) {
                frame.body.truncate(length);
            }
        }
        Ok(Some(frame))
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(TransportError::Protocol(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// STOMP-over-WebSocket transport.
pub struct StompTransport {
    sink: Mutex<Option<WsSink>>,
    inbound: Mutex<Option<mpsc::Receiver<Frame>>>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    next_subscription: AtomicU64,
}

impl StompTransport {
    /// Create a disconnected transport.
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            inbound: Mutex::new(None),
            pump: std::sync::Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            next_subscription: AtomicU64::new(0),
        }
    }

    async fn write(&self, frame: StompFrame) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        trace!(command = %frame.command, "--> stomp frame");
        sink.send(Message::Text(frame.encode().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn stop_pump(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Default for StompTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StompTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompTransport")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Transport for StompTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        self.stop_pump();
        info!(%address, "dialing broker");

        let (ws, _response) = tokio_tungstenite::connect_async(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let host = address
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split(['/', ':']).next())
            .unwrap_or("localhost");
        let hello = StompFrame::new("CONNECT")
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", "0,0");
        sink.send(Message::Text(hello.encode().into()))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tokio::time::timeout(HANDSHAKE_TIMEOUT, await_connected(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        *self.sink.lock().await = Some(sink);
        *self.inbound.lock().await = Some(rx);
        self.connected.store(true, Ordering::SeqCst);

        let pump = tokio::spawn(read_pump(stream, tx, Arc::clone(&self.connected)));
        *self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pump);

        info!(%address, "broker connected");
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<SubscriptionId, TransportError> {
        let n = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let id = SubscriptionId::new(format!("sub-{n}"));
        self.write(
            StompFrame::new("SUBSCRIBE")
                .header("id", id.as_str())
                .header("destination", destination)
                .header("ack", "auto"),
        )
        .await
        .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
        debug!(%destination, subscription = %id, "subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        self.write(StompFrame::new("UNSUBSCRIBE").header("id", id.as_str()))
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
    }

    async fn send(&self, destination: &str, body: &str) -> Result<(), TransportError> {
        let length = body.len().to_string();
        self.write(
            StompFrame::new("SEND")
                .header("destination", destination)
                .header("content-type", "application/json")
                .header("content-length", &length)
                .body(body),
        )
        .await
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut guard = self.inbound.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::NotConnected)?;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let bye = StompFrame::new("DISCONNECT").encode();
            if let Err(e) = sink.send(Message::Text(bye.into())).await {
                debug!(error = %e, "DISCONNECT not delivered");
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "socket close failed");
            }
        }
        self.stop_pump();
        *self.inbound.lock().await = None;
        Ok(())
    }
}

async fn await_connected(stream: &mut WsStream) -> Result<(), TransportError> {
    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        match StompFrame::decode(text.as_str())? {
            Some(frame) if frame.command == "CONNECTED" => return Ok(()),
            Some(frame) if frame.command == "ERROR" => {
                let reason = frame.get("message").unwrap_or("broker refused").to_string();
                return Err(TransportError::ConnectionFailed(reason));
            }
            _ => continue,
        }
    }
    Err(TransportError::ConnectionClosed)
}

async fn read_pump(mut stream: WsStream, tx: mpsc::Sender<Frame>, connected: Arc<AtomicBool>) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!("broker closed the socket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "broker socket error");
                break;
            }
        };
        let frame = match StompFrame::decode(text.as_str()) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "dropping undecodable stomp frame");
                continue;
            }
        };
        match frame.command.as_str() {
            "MESSAGE" => {
                let (Some(subscription), Some(destination)) =
                    (frame.get("subscription"), frame.get("destination"))
                else {
                    warn!("MESSAGE frame without subscription or destination");
                    continue;
                };
                let inbound = Frame {
                    subscription: SubscriptionId::new(subscription),
                    destination: destination.to_string(),
                    body: frame.body.clone(),
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
            "ERROR" => {
                warn!(message = frame.get("message").unwrap_or(""), "broker error frame");
                break;
            }
            other => trace!(command = other, "ignoring stomp frame"),
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_encodes_with_nul() {
        let frame = StompFrame::new("SEND")
            .header("destination", "/app/chat")
            .body("{\"a\":1}");
        assert_eq!(frame.encode(), "SEND\ndestination:/app/chat\n\n{\"a\":1}\0");
    }

    #[test]
    fn header_values_are_escaped() {
        let frame = StompFrame::new("SEND").header("note", "a:b\nc");
        assert_eq!(frame.encode(), "SEND\nnote:a\\cb\\nc\n\n\0");
    }

    #[test]
    fn connect_frame_is_not_escaped() {
        let frame = StompFrame::new("CONNECT").header("host", "broker:8080");
        assert!(frame.encode().contains("host:broker:8080"));
    }

    #[test]
    fn message_frame_decodes() {
        let raw = "MESSAGE\nsubscription:sub-0\ndestination:/topic/chat/BK1\nmessage-id:7\n\n{\"message\":\"hi\"}\0";
        let frame = StompFrame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.command, "MESSAGE");
        assert_eq!(frame.get("subscription"), Some("sub-0"));
        assert_eq!(frame.get("destination"), Some("/topic/chat/BK1"));
        assert_eq!(frame.body, "{\"message\":\"hi\"}");
    }

    #[test]
    fn escaped_headers_round_back() {
        let raw = "MESSAGE\nnote:a\\cb\\\\c\n\n\0";
        let frame = StompFrame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.get("note"), Some("a:b\\c"));
    }

    #[test]
    fn content_length_trims_body() {
        let raw = "MESSAGE\ncontent-length:2\n\n{}trailing\0";
        let frame = StompFrame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.body, "{}");
    }

    #[test]
    fn heartbeat_is_not_a_frame() {
        assert_eq!(StompFrame::decode("\n").unwrap(), None);
        assert_eq!(StompFrame::decode("\r\n").unwrap(), None);
    }

    #[test]
    fn crlf_frames_decode() {
        let raw = "CONNECTED\r\nversion:1.2\r\n\r\n\0";
        let frame = StompFrame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.command, "CONNECTED");
        assert_eq!(frame.get("version"), Some("1.2"));
    }

    #[test]
    fn bad_header_is_protocol_error() {
        let raw = "MESSAGE\nno-colon-here\n\n\0";
        assert!(matches!(
            StompFrame::decode(raw),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn fresh_transport_is_disconnected() {
        let transport = StompTransport::new();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn operations_fail_before_connect() {
        let transport = StompTransport::new();
        assert!(matches!(
            transport.send("/app/chat", "{}").await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::NotConnected)
        ));
    }
}
