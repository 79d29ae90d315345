use crate::error::StreamError;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, SinkExt, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of one logical stream.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub credential: String,
    pub company_lab: String,
    pub machine_id: String,
}

impl StreamTarget {
    pub fn new(
        credential: impl Into<String>,
        company_lab: impl Into<String>,
        machine_id: impl Into<String>,
    ) -> Self {
        Self {
            credential: credential.into(),
            company_lab: company_lab.into(),
            machine_id: machine_id.into(),
        }
    }
}

impl fmt::Debug for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTarget")
            .field("credential", &"<redacted>")
            .field("company_lab", &self.company_lab)
            .field("machine_id", &self.machine_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
    Failed(StreamError),
}

/// An open channel: inbound frames plus a way to close it from our side.
pub struct TransportSession {
    frames: BoxStream<'static, TransportFrame>,
    close: Option<BoxFuture<'static, ()>>,
}

impl TransportSession {
    pub fn new(frames: impl Stream<Item = TransportFrame> + Send + 'static) -> Self {
        Self {
            frames: frames.boxed(),
            close: None,
        }
    }

    pub fn with_close(mut self, close: impl Future<Output = ()> + Send + 'static) -> Self {
        self.close = Some(close.boxed());
        self
    }

    pub async fn next_frame(&mut self) -> Option<TransportFrame> {
        self.frames.next().await
    }

    pub async fn close(self) {
        drop(self.frames);
        if let Some(close) = self.close {
            close.await;
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    fn open<'a>(
        &'a self,
        target: &'a StreamTarget,
    ) -> BoxFuture<'a, Result<TransportSession, StreamError>>;
}

/// Push channel over WebSocket. The credential and scope travel as query
/// parameters (`token`, `company_lab`, `machine`).
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn stream_url(&self, target: &StreamTarget) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("token", &target.credential)
            .append_pair("company_lab", &target.company_lab)
            .append_pair("machine", &target.machine_id);
        url
    }
}

impl Transport for WebSocketTransport {
    fn open<'a>(
        &'a self,
        target: &'a StreamTarget,
    ) -> BoxFuture<'a, Result<TransportSession, StreamError>> {
        async move {
            let url = self.stream_url(target);
            let connecting = connect_async(url.as_str());
            let (socket, _response) = tokio::time::timeout(self.connect_timeout, connecting)
                .await
                .map_err(|_| StreamError::Transport("connect timed out".to_string()))?
                .map_err(|err| StreamError::Transport(err.to_string()))?;

            let (mut sink, stream) = socket.split();
            let frames = stream.filter_map(|message| async move { map_message(message) });
            Ok(TransportSession::new(frames).with_close(async move {
                if let Err(err) = sink.close().await {
                    tracing::debug!(error = %err, "websocket close handshake failed");
                }
            }))
        }
        .boxed()
    }
}

fn map_message(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<TransportFrame> {
    match message {
        Ok(Message::Text(text)) => Some(TransportFrame::Text(text)),
        Ok(Message::Binary(bytes)) => Some(TransportFrame::Binary(bytes)),
        Ok(Message::Close(frame)) => Some(TransportFrame::Closed {
            code: frame.as_ref().map(|f| u16::from(f.code)),
            reason: frame
                .map(|f| f.reason.into_owned())
                .unwrap_or_default(),
        }),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(err) => Some(TransportFrame::Failed(StreamError::Transport(
            err.to_string(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_carries_scope_and_credential() {
        let transport = WebSocketTransport::new(Url::parse("wss://api.example.com/ws").unwrap());
        let url = transport.stream_url(&StreamTarget::new("t0k en", "acme-lab1", "aq"));
        assert_eq!(
            url.as_str(),
            "wss://api.example.com/ws?token=t0k+en&company_lab=acme-lab1&machine=aq"
        );
    }

    #[test]
    fn debug_redacts_credential() {
        let rendered = format!("{:?}", StreamTarget::new("secret", "lab", "m"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("lab"));
    }

    #[test]
    fn control_frames_are_skipped() {
        assert_eq!(map_message(Ok(Message::Ping(vec![1]))), None);
        assert_eq!(
            map_message(Ok(Message::Text("{}".into()))),
            Some(TransportFrame::Text("{}".into()))
        );
        assert_eq!(
            map_message(Ok(Message::Close(None))),
            Some(TransportFrame::Closed {
                code: None,
                reason: String::new()
            })
        );
    }
}
