// THEORY:
// The transport channel owns the one WebSocket connection a session talks to
// the analyzer over. It hides the socket behind two narrow ends:
//
// - an outbound `FrameSender` with room for exactly one frame in flight, which
//   the sampler offers frames to (a full slot means the frame is dropped);
// - an inbound, strictly ordered queue of `ChannelEvent`s, one per analyzer
//   message, that the session loop hands to the reconciler. The queue is
//   bounded; when it is full the reader stops pulling from the socket and TCP
//   flow control pushes back on the analyzer.
//
// The socket is split into a writer task and a reader task. Both are owned by
// the `TransportChannel` value and aborted when it is dropped, so the
// connection is released on every exit path. `close` additionally sends a
// WebSocket close frame first, and once it returns no further events can be
// observed because the channel has been consumed.

use crate::core_modules::analytics::{AnalyticsPayload, OutgoingFrame};
use crate::core_modules::frame_sampler::FrameSink;
use crate::core_modules::wire::{self, Inbound};
use crate::error::{LiveError, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Inbound events buffered before the reader stops reading the socket.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// One event per inbound analyzer message, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Payload(AnalyticsPayload),
    /// The message did not match any known shape and was dropped.
    Malformed(String),
    /// The analyzer reported an error. Terminal for the session.
    AnalyzerError(String),
    /// The connection ended from the far side.
    Closed(String),
}

/// Opens connections to the analyzer.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &Url) -> BoxFuture<'static, Result<TransportChannel>>;
}

/// Connects over a real WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, endpoint: &Url) -> BoxFuture<'static, Result<TransportChannel>> {
        let endpoint = endpoint.clone();
        async move {
            let (socket, _response) = tokio_tungstenite::connect_async(endpoint.as_str())
                .await
                .map_err(|e| LiveError::ConnectFailed(e.to_string()))?;
            info!(%endpoint, "analyzer connection established");
            Ok(TransportChannel::from_socket(socket))
        }
        .boxed()
    }
}

/// The outbound end handed to the frame sampler.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<OutgoingFrame>,
}

impl FrameSink for FrameSender {
    fn offer(&mut self, frame: OutgoingFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

pub struct TransportChannel {
    frames: mpsc::Sender<OutgoingFrame>,
    events: mpsc::Receiver<ChannelEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl TransportChannel {
    /// Opens a channel through `connector`, failing with `ConnectFailed` if the
    /// handshake does not complete within `timeout`.
    pub async fn open(connector: &dyn Connector, endpoint: &Url, timeout: Duration) -> Result<Self> {
        match tokio::time::timeout(timeout, connector.connect(endpoint)).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(LiveError::ConnectFailed(reason))) => Err(LiveError::ConnectFailed(reason)),
            Ok(Err(other)) => Err(LiveError::ConnectFailed(other.to_string())),
            Err(_) => Err(LiveError::ConnectFailed(format!(
                "no handshake from {endpoint} within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Wraps an already-handshaken WebSocket.
    pub fn from_socket<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = socket.split();
        let (frames_tx, mut frames_rx) = mpsc::channel::<OutgoingFrame>(1);
        let (events_tx, events_rx) = mpsc::channel::<ChannelEvent>(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let writer_events = events_tx.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        break;
                    }
                    frame = frames_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match wire::encode_frame(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "dropping frame that failed to serialize");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            let _ = writer_events.send(ChannelEvent::Closed(err.to_string())).await;
                            break;
                        }
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            loop {
                let event = match stream.next().await {
                    Some(Ok(Message::Text(text))) => decode(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => decode(text),
                        Err(_) => ChannelEvent::Malformed("binary message is not UTF-8".to_string()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "no close reason".to_string());
                        let _ = events_tx.send(ChannelEvent::Closed(reason)).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        let _ = events_tx.send(ChannelEvent::Closed(err.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = events_tx.send(ChannelEvent::Closed("connection ended".to_string())).await;
                        break;
                    }
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        Self {
            frames: frames_tx,
            events: events_rx,
            shutdown: Some(shutdown_tx),
            writer,
            reader,
        }
    }

    /// The outbound end for the sampler. Holds at most one frame.
    pub fn frame_sender(&self) -> FrameSender {
        FrameSender {
            tx: self.frames.clone(),
        }
    }

    /// Next inbound event, or `None` once both tasks have ended.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Sends a close frame, waits up to `grace` for it to flush, then tears the
    /// connection down. No events are delivered after this returns.
    pub async fn close(mut self, grace: Duration) {
        self.events.close();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(grace, &mut self.writer).await.is_err() {
            debug!("close frame not flushed in time, aborting writer");
        }
        self.reader.abort();
        info!("analyzer connection closed");
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

fn decode(text: &str) -> ChannelEvent {
    match wire::decode_inbound(text) {
        Ok(Inbound::Payload(payload)) => ChannelEvent::Payload(payload),
        Ok(Inbound::Failure(message)) => ChannelEvent::AnalyzerError(message),
        Err(err) => ChannelEvent::Malformed(err.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    /// A connected client channel plus the analyzer's end of the socket.
    pub(crate) async fn channel_pair() -> (TransportChannel, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (TransportChannel::from_socket(client), server)
    }

    fn frame(ms: u64) -> OutgoingFrame {
        OutgoingFrame {
            image_bytes: vec![1, 2, 3],
            captured_at_ms: ms,
        }
    }

    #[tokio::test]
    async fn frames_arrive_as_image_json() {
        let (channel, mut analyzer) = channel_pair().await;
        let mut sender = channel.frame_sender();
        assert!(sender.offer(frame(0)));

        let Some(Ok(Message::Text(text))) = analyzer.next().await else {
            panic!("expected a text frame");
        };
        assert_eq!(text, r#"{"image":"AQID"}"#);
    }

    #[tokio::test]
    async fn inbound_messages_become_ordered_events() {
        let (mut channel, mut analyzer) = channel_pair().await;
        analyzer
            .send(Message::Text(r#"{"analysis":{"total_count":1}}"#.into()))
            .await
            .unwrap();
        analyzer.send(Message::Text("garbage".into())).await.unwrap();
        analyzer
            .send(Message::Text(r#"{"analysis":{"total_count":2}}"#.into()))
            .await
            .unwrap();

        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Payload(AnalyticsPayload::with_total_count(1)))
        );
        assert!(matches!(channel.next_event().await, Some(ChannelEvent::Malformed(_))));
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Payload(AnalyticsPayload::with_total_count(2)))
        );
    }

    #[tokio::test]
    async fn error_messages_are_reported_as_analyzer_errors() {
        let (mut channel, mut analyzer) = channel_pair().await;
        analyzer
            .send(Message::Text(r#"{"error":"An internal error occurred."}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::AnalyzerError("An internal error occurred.".to_string()))
        );
    }

    #[tokio::test]
    async fn a_slow_consumer_holds_back_the_reader_without_losing_events() {
        let (mut channel, mut analyzer) = channel_pair().await;
        let total = EVENT_QUEUE_CAPACITY as u32 * 3;
        let writer = tokio::spawn(async move {
            for count in 0..total {
                let text = format!(r#"{{"analysis":{{"total_count":{count}}}}}"#);
                analyzer.send(Message::Text(text)).await.unwrap();
            }
            analyzer
        });

        // Let the reader fill the queue while nothing consumes it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.events.len() <= EVENT_QUEUE_CAPACITY);

        for count in 0..total {
            assert_eq!(
                channel.next_event().await,
                Some(ChannelEvent::Payload(AnalyticsPayload::with_total_count(count)))
            );
        }
        let _analyzer = writer.await.unwrap();
    }

    #[tokio::test]
    async fn remote_close_is_reported() {
        let (mut channel, mut analyzer) = channel_pair().await;
        analyzer.close(None).await.unwrap();
        assert!(matches!(channel.next_event().await, Some(ChannelEvent::Closed(_))));
    }

    #[tokio::test]
    async fn close_sends_a_close_frame() {
        let (channel, mut analyzer) = channel_pair().await;
        channel.close(Duration::from_secs(1)).await;
        loop {
            match analyzer.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn a_full_slot_drops_the_next_frame() {
        let (channel, _analyzer) = channel_pair().await;
        let mut sender = channel.frame_sender();
        let mut accepted = 0;
        for i in 0..50 {
            if sender.offer(frame(i)) {
                accepted += 1;
            }
        }
        assert!(accepted < 50);
    }

    struct NeverConnects;

    impl Connector for NeverConnects {
        fn connect(&self, _endpoint: &Url) -> BoxFuture<'static, Result<TransportChannel>> {
            futures::future::pending().boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_times_out_as_connect_failed() {
        let endpoint = Url::parse("ws://127.0.0.1:9/ws/live").unwrap();
        let err = TransportChannel::open(&NeverConnects, &endpoint, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LiveError::ConnectFailed(_)));
    }
}
