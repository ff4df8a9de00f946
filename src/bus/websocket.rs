//! WebSocket message bus client
//!
//! One WebSocket per joined channel. Frames are JSON text messages tagged by
//! `type`; the server confirms a subscription with `joined` and fans out
//! `broadcast` frames to every other member of the topic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{BusChannel, BusError, BusMessage, ChannelConfig, MessageBus};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Wire frames exchanged with the bus server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Join {
        topic: String,
        config: ChannelConfig,
    },
    Joined {
        topic: String,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
    Leave {
        topic: String,
    },
    Heartbeat,
    Error {
        message: String,
    },
}

impl Frame {
    fn to_message(&self) -> Result<Message, BusError> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Message bus reached over a WebSocket endpoint.
pub struct WsBus {
    url: String,
    token: Option<String>,
}

impl WsBus {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    fn endpoint(&self) -> Result<String, BusError> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| BusError::Connect(format!("invalid bus url {}: {}", self.url, e)))?;
        if let Some(ref token) = self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        let url = url
            .as_str()
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        Ok(url)
    }
}

#[async_trait]
impl MessageBus for WsBus {
    async fn open(
        &self,
        name: &str,
        config: ChannelConfig,
    ) -> Result<Box<dyn BusChannel>, BusError> {
        let endpoint = self.endpoint()?;
        tracing::debug!("Connecting bus WebSocket for {}", name);

        let (mut stream, response) = connect_async(&endpoint)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        tracing::debug!("Bus WebSocket connected (status={})", response.status());

        let join = Frame::Join {
            topic: name.to_string(),
            config,
        };
        stream.send(join.to_message()?).await?;

        time::timeout(JOIN_TIMEOUT, wait_joined(&mut stream, name))
            .await
            .map_err(|_| BusError::Protocol(format!("no join confirmation for {}", name)))??;
        tracing::info!("Subscribed to {}", name);

        let client_id = uuid::Uuid::new_v4().to_string();
        let (sink, source) = stream.split();
        let sink = Arc::new(Mutex::new(sink));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            source,
            sink.clone(),
            tx,
            name.to_string(),
            client_id.clone(),
            config,
        ));

        Ok(Box::new(WsChannel {
            name: name.to_string(),
            client_id,
            sink,
            rx,
            reader: Some(reader),
        }))
    }
}

/// Read frames until the server confirms our subscription.
async fn wait_joined(stream: &mut WsStream, topic: &str) -> Result<(), BusError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Joined { topic: t }) if t == topic => return Ok(()),
                Ok(Frame::Error { message }) => return Err(BusError::Protocol(message)),
                Ok(other) => tracing::debug!("Ignoring frame before join: {:?}", other),
                Err(e) => tracing::debug!("Unparseable frame before join: {}", e),
            },
            Message::Ping(data) => stream.send(Message::Pong(data)).await?,
            Message::Close(frame) => {
                return Err(BusError::Connect(format!("closed during join: {:?}", frame)))
            }
            _ => {}
        }
    }
    Err(BusError::Closed(topic.to_string()))
}

/// Forward broadcasts for `topic` to the channel owner and keep the socket alive.
async fn read_loop(
    mut source: futures::stream::SplitStream<WsStream>,
    sink: Arc<Mutex<WsSink>>,
    tx: mpsc::UnboundedSender<BusMessage>,
    topic: String,
    client_id: String,
    config: ChannelConfig,
) {
    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(Frame::Broadcast { topic: t, event, payload, origin }) if t == topic => {
                                let own = origin.as_deref() == Some(client_id.as_str());
                                if own && !config.self_delivery {
                                    continue;
                                }
                                if tx.send(BusMessage { event, payload }).is_err() {
                                    break;
                                }
                            }
                            Ok(Frame::Error { message }) => {
                                tracing::warn!("Bus error on {}: {}", topic, message);
                            }
                            Ok(other) => tracing::debug!("Bus frame (ignored): {:?}", other),
                            Err(e) => tracing::debug!("Unparseable bus frame on {}: {}", topic, e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.lock().await.send(Message::Pong(data)).await {
                            tracing::warn!("Failed to send pong on {}: {}", topic, e);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Bus closed {}: {:?}", topic, frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Bus receive error on {}: {}", topic, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                let sent = match Frame::Heartbeat.to_message() {
                    Ok(msg) => sink.lock().await.send(msg).await.map_err(BusError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::warn!("Heartbeat failed on {}: {}", topic, e);
                    break;
                }
            }
        }
    }
}

struct WsChannel {
    name: String,
    client_id: String,
    sink: Arc<Mutex<WsSink>>,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    /// `None` once closed.
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl BusChannel for WsChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn broadcast(&self, event: &str, payload: serde_json::Value) -> Result<(), BusError> {
        if self.reader.is_none() {
            return Err(BusError::Closed(self.name.clone()));
        }
        let frame = Frame::Broadcast {
            topic: self.name.clone(),
            event: event.to_string(),
            payload,
            origin: Some(self.client_id.clone()),
        };
        tracing::debug!("Bus send {} on {}", event, self.name);
        self.sink.lock().await.send(frame.to_message()?).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<BusMessage> {
        if self.reader.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        reader.abort();

        let mut sink = self.sink.lock().await;
        let leave = Frame::Leave {
            topic: self.name.clone(),
        };
        if let Ok(msg) = leave.to_message() {
            let _ = sink.send(msg).await;
        }
        let _ = sink.close().await;
        tracing::info!("Left {}", self.name);
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_frame_wire_shape() {
        let frame = Frame::Join {
            topic: "call:a_b".to_string(),
            config: ChannelConfig::low_latency(),
        };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            v,
            json!({"type": "join", "topic": "call:a_b", "config": {"ack": false, "self": false}})
        );
    }

    #[test]
    fn test_parse_server_frames() {
        let joined: Frame = serde_json::from_str(r#"{"type":"joined","topic":"inbox:u1"}"#).unwrap();
        assert_eq!(
            joined,
            Frame::Joined {
                topic: "inbox:u1".to_string()
            }
        );

        // Broadcasts relayed from other clients may omit the origin.
        let bc: Frame = serde_json::from_str(
            r#"{"type":"broadcast","topic":"inbox:u1","event":"incoming-call","payload":{"x":1}}"#,
        )
        .unwrap();
        match bc {
            Frame::Broadcast { event, origin, .. } => {
                assert_eq!(event, "incoming-call");
                assert!(origin.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_is_bare_type() {
        let text = serde_json::to_string(&Frame::Heartbeat).unwrap();
        assert_eq!(text, r#"{"type":"heartbeat"}"#);
    }

    #[test]
    fn test_endpoint_carries_token_and_ws_scheme() {
        let bus = WsBus::new("https://bus.example.com/socket", Some("t0k".to_string()));
        let url = bus.endpoint().unwrap();
        assert_eq!(url, "wss://bus.example.com/socket?token=t0k");

        let bad = WsBus::new("not a url", None);
        assert!(bad.endpoint().is_err());
    }
}
