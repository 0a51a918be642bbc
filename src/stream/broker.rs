//! Streaming broker: live connections, per-connection queues, fan-out
//!
//! Each connection owns a bounded outbound queue (FIFO, so a `done` frame is
//! always observed after its preceding `token` frames). A producer that
//! would overflow a slow consumer's queue drops that connection instead of
//! blocking or buffering unboundedly; the drop is a normal disconnect and is
//! never surfaced to other subscribers. Subscriptions live only in process
//! memory and die with the connection.

use crate::stream::message::StreamMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::Stream;
use tracing::debug;
use uuid::Uuid;

/// Logical streaming topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Broadcast refresh signals to every open dashboard subscriber
    Dashboard,
    /// Per-connection chat completion delivery
    Chat,
}

/// Connection lifecycle: `Connecting -> Open -> {Draining -> Closed | Closed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// No further application messages are delivered; already-queued frames
    /// may still flush to the transport.
    Draining,
    Closed,
}

/// A live streaming connection (in-process only, never persisted)
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub channel: ChannelKind,
    pub filter: Option<String>,
    pub opened_at: DateTime<Utc>,
}

struct Connection {
    sub: Subscription,
    tx: mpsc::Sender<StreamMessage>,
    state: ConnectionState,
}

/// How long a per-connection producer may wait on a full queue before the
/// connection is treated as a slow consumer and dropped
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Streaming broker managing all live connections
pub struct StreamBroker {
    queue_capacity: usize,
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl StreamBroker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Open a connection on `channel`. The returned receiver is the
    /// connection's outbound queue; dropping it closes the connection.
    pub async fn subscribe(
        &self,
        channel: ChannelKind,
        filter: Option<String>,
    ) -> (Subscription, mpsc::Receiver<StreamMessage>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let sub = Subscription {
            id: Uuid::new_v4(),
            channel,
            filter,
            opened_at: Utc::now(),
        };

        let mut conn = Connection {
            sub: sub.clone(),
            tx,
            state: ConnectionState::Connecting,
        };
        // The transport handshake is complete by the time the handler asks
        // for a subscription, so the connection opens immediately.
        conn.state = ConnectionState::Open;

        self.connections.write().await.insert(sub.id, conn);
        debug!(id = %sub.id, channel = ?channel, "stream subscribed");

        (sub, rx)
    }

    /// Deliver one message to a single connection (chat path).
    ///
    /// Returns false once the connection is draining, closed, or has been
    /// dropped as a slow consumer; producers use that as their stop signal.
    pub async fn send_to(&self, id: Uuid, msg: StreamMessage) -> bool {
        let tx = {
            let conns = self.connections.read().await;
            match conns.get(&id) {
                Some(conn) if conn.state == ConnectionState::Open => conn.tx.clone(),
                _ => return false,
            }
        };

        match tx.send_timeout(msg, SEND_TIMEOUT).await {
            Ok(()) => true,
            Err(_) => {
                debug!(id = %id, "dropping slow or closed consumer");
                self.disconnect(id).await;
                false
            }
        }
    }

    /// Broadcast to every open connection on `channel`. Slow or closed
    /// consumers are dropped silently; delivery to the rest is unaffected.
    pub async fn broadcast(&self, channel: ChannelKind, msg: StreamMessage) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<StreamMessage>)> = {
            let conns = self.connections.read().await;
            conns
                .values()
                .filter(|c| c.sub.channel == channel && c.state == ConnectionState::Open)
                .map(|c| (c.sub.id, c.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, tx) in targets {
            match tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dropped.push(id),
            }
        }

        for id in dropped {
            debug!(id = %id, "dropping slow dashboard subscriber");
            self.disconnect(id).await;
        }

        delivered
    }

    /// Broadcast one refresh tick to all dashboard subscribers
    pub async fn notify_refresh(&self) -> usize {
        self.broadcast(ChannelKind::Dashboard, StreamMessage::refresh())
            .await
    }

    /// Stop delivering application messages to a connection; queued frames
    /// may still flush. Used for client-initiated cancel.
    pub async fn drain(&self, id: Uuid) {
        let mut conns = self.connections.write().await;
        if let Some(conn) = conns.get_mut(&id) {
            if conn.state == ConnectionState::Open {
                conn.state = ConnectionState::Draining;
                debug!(id = %id, "stream draining");
            }
        }
    }

    /// Terminal: deregister the connection from its channel
    pub async fn disconnect(&self, id: Uuid) {
        let mut conns = self.connections.write().await;
        if let Some(mut conn) = conns.remove(&id) {
            conn.state = ConnectionState::Closed;
            debug!(id = %id, channel = ?conn.sub.channel, "stream closed");
        }
    }

    /// Current state of a connection, if it is still registered
    pub async fn state(&self, id: Uuid) -> Option<ConnectionState> {
        self.connections.read().await.get(&id).map(|c| c.state)
    }

    pub async fn subscriber_count(&self, channel: ChannelKind) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.sub.channel == channel)
            .count()
    }

    pub async fn total_subscribers(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Stream adapter over a connection's queue that deregisters the connection
/// from the broker when the transport drops it (client navigated away,
/// explicit stop, process shutdown).
pub struct ConnectionStream {
    id: Uuid,
    rx: mpsc::Receiver<StreamMessage>,
    broker: Arc<StreamBroker>,
}

impl ConnectionStream {
    pub fn new(id: Uuid, rx: mpsc::Receiver<StreamMessage>, broker: Arc<StreamBroker>) -> Self {
        Self { id, rx, broker }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Stream for ConnectionStream {
    type Item = StreamMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ConnectionStream {
    fn drop(&mut self) {
        let broker = self.broker.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                broker.disconnect(id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn test_subscribe_and_receive_fifo() {
        let broker = StreamBroker::new(8);
        let (sub, mut rx) = broker.subscribe(ChannelKind::Chat, None).await;

        assert!(broker.send_to(sub.id, StreamMessage::token("a")).await);
        assert!(broker.send_to(sub.id, StreamMessage::token("b")).await);
        assert!(broker.send_to(sub.id, StreamMessage::Done).await);

        assert_eq!(rx.recv().await.unwrap(), StreamMessage::token("a"));
        assert_eq!(rx.recv().await.unwrap(), StreamMessage::token("b"));
        assert_eq!(rx.recv().await.unwrap(), StreamMessage::Done);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_dashboard_subscribers() {
        let broker = StreamBroker::new(8);
        let (_s1, mut rx1) = broker.subscribe(ChannelKind::Dashboard, None).await;
        let (_s2, mut rx2) = broker.subscribe(ChannelKind::Dashboard, None).await;
        let (_s3, mut rx3) = broker.subscribe(ChannelKind::Chat, None).await;

        let delivered = broker.notify_refresh().await;
        assert_eq!(delivered, 2);

        assert!(matches!(rx1.recv().await, Some(StreamMessage::Refresh { .. })));
        assert!(matches!(rx2.recv().await, Some(StreamMessage::Refresh { .. })));
        // chat connections never see dashboard traffic
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_dropped_silently() {
        let broker = StreamBroker::new(1);
        let (slow, _rx_kept_but_unread) = broker.subscribe(ChannelKind::Dashboard, None).await;
        let (_fast, mut fast_rx) = broker.subscribe(ChannelKind::Dashboard, None).await;

        // first tick fills the slow consumer's single-slot queue
        broker.notify_refresh().await;
        // the fast consumer drains its queue, the slow one does not
        assert!(matches!(fast_rx.recv().await, Some(StreamMessage::Refresh { .. })));

        // second tick overflows the slow consumer; it is dropped
        broker.notify_refresh().await;

        assert!(broker.state(slow.id).await.is_none());
        assert_eq!(broker.subscriber_count(ChannelKind::Dashboard).await, 1);

        // delivery to the fast consumer is unaffected
        assert!(matches!(fast_rx.recv().await, Some(StreamMessage::Refresh { .. })));
    }

    #[tokio::test]
    async fn test_drain_stops_application_messages() {
        let broker = StreamBroker::new(8);
        let (sub, mut rx) = broker.subscribe(ChannelKind::Chat, None).await;

        assert!(broker.send_to(sub.id, StreamMessage::token("before")).await);
        broker.drain(sub.id).await;
        assert!(!broker.send_to(sub.id, StreamMessage::token("after")).await);

        // the already-buffered frame still flushes
        assert_eq!(rx.recv().await.unwrap(), StreamMessage::token("before"));
        assert_eq!(broker.state(sub.id).await, Some(ConnectionState::Draining));
    }

    #[tokio::test]
    async fn test_disconnect_deregisters() {
        let broker = StreamBroker::new(8);
        let (sub, _rx) = broker.subscribe(ChannelKind::Dashboard, None).await;
        assert_eq!(broker.total_subscribers().await, 1);

        broker.disconnect(sub.id).await;
        assert_eq!(broker.total_subscribers().await, 0);
        assert!(!broker.send_to(sub.id, StreamMessage::Done).await);
    }

    #[tokio::test]
    async fn test_connection_stream_cleans_up_on_drop() {
        let broker = Arc::new(StreamBroker::new(8));
        let (sub, rx) = broker.subscribe(ChannelKind::Dashboard, None).await;

        {
            let mut stream = ConnectionStream::new(sub.id, rx, broker.clone());
            broker.send_to(sub.id, StreamMessage::ping()).await;
            assert!(matches!(stream.next().await, Some(StreamMessage::Ping { .. })));
        }

        // Drop handler deregisters asynchronously
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.total_subscribers().await, 0);
    }
}
