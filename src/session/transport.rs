//! Transport seam
//!
//! The supervisor only ever talks to a [`Link`]: a text sink plus an event
//! source. [`WebSocketConnector`] opens real links with tokio-tungstenite;
//! tests plug in an in-memory connector instead.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::error::TransportError;

/// Close code of a clean, intentional shutdown
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the peer vanished without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close frame without a status code
pub const NO_STATUS: u16 = 1005;

/// Something read from an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame, to be decoded and routed
    Text(String),
    /// Ping, pong or binary traffic; proves liveness, never routed
    Activity,
    /// The peer closed the connection
    Closed { code: u16, reason: String },
}

/// Write half of a link
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Start a clean close with [`NORMAL_CLOSURE`]
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a link
#[async_trait]
pub trait FrameSource: Send {
    /// Next event, or `None` once the stream has ended
    async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>>;
}

/// An open connection, split so reads and writes borrow independently
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens links to a WebSocket endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Link, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Link, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(url = %url, status = %response.status(), "WebSocket handshake complete");

        let (sink, source) = stream.split();
        Ok(Link {
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: source }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client disconnect".into(),
        };
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
        };

        let event = match message {
            Message::Text(text) => TransportEvent::Text(text.as_str().to_owned()),
            Message::Close(frame) => match frame {
                Some(frame) => TransportEvent::Closed {
                    code: u16::from(frame.code),
                    reason: frame.reason.as_str().to_owned(),
                },
                None => TransportEvent::Closed {
                    code: NO_STATUS,
                    reason: String::new(),
                },
            },
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                TransportEvent::Activity
            }
        };
        Some(Ok(event))
    }
}
