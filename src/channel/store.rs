use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Channel, ChannelError, ChannelManager, ChannelMode};
use crate::config::TunnelConfig;
use crate::connection::Connection;
use crate::messages::{
    peek_type, ChannelClose, ChannelData, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelWindowAdjust, DecodeError, MessageType,
};

#[derive(Debug)]
struct StoreInner {
    channels: HashMap<u32, Arc<Channel>>,
    next_channel_id: u32,
}

/// Registry of multiplexed channels sharing one connection.
///
/// Channel IDs start at 1 and are never handed out twice, even after the
/// channel holding one is unregistered. The store owns every registered
/// channel; unregistering closes it.
#[derive(Debug)]
pub struct ChannelStore {
    inner: Mutex<StoreInner>,
    connection: Arc<Connection>,
    rx_window_size: u32,
    data_queue_depth: usize,
}

impl ChannelStore {
    pub fn new(connection: Arc<Connection>, config: &TunnelConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                channels: HashMap::new(),
                next_channel_id: 1,
            }),
            connection,
            rx_window_size: config.rx_window_size,
            data_queue_depth: config.data_queue_depth,
        }
    }

    pub fn register(&self) -> Result<Arc<Channel>, ChannelError> {
        let mut inner = self.inner.lock();
        let id = inner.next_channel_id;
        inner.next_channel_id = id.checked_add(1).ok_or(ChannelError::IdsExhausted)?;
        let channel = Arc::new(Channel::new(
            ChannelMode::Multiplexed,
            id,
            self.rx_window_size,
            self.data_queue_depth,
        ));
        inner.channels.insert(id, channel.clone());
        tracing::debug!(channel = id, active = inner.channels.len(), "registered channel");
        Ok(channel)
    }

    pub fn unregister(&self, sender_channel: u32) -> Option<Arc<Channel>> {
        let removed = self.inner.lock().channels.remove(&sender_channel);
        if let Some(channel) = &removed {
            channel.mark_closed();
            tracing::debug!(channel = sender_channel, "unregistered channel");
        }
        removed
    }

    pub fn get(&self, sender_channel: u32) -> Option<Arc<Channel>> {
        self.inner.lock().channels.get(&sender_channel).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every channel, as when the physical connection drops.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.inner.lock().channels.drain().collect();
        for (_, channel) in drained {
            channel.mark_closed();
        }
    }

    /// Applies one inbound channel-scoped frame to the channel it addresses.
    ///
    /// Frames for channels that are not registered are dropped.
    pub async fn dispatch(&self, frame: &[u8]) -> Result<(), DecodeError> {
        match peek_type(frame)? {
            MessageType::ChannelOpenConfirmation => {
                let msg = ChannelOpenConfirmation::decode(frame)?;
                if let Some(channel) = self.lookup(msg.recipient_channel, "open confirmation") {
                    channel.confirm(&msg);
                }
            }
            MessageType::ChannelOpenFailure => {
                let msg = ChannelOpenFailure::decode(frame)?;
                if let Some(channel) = self.lookup(msg.recipient_channel, "open failure") {
                    channel.signal_open(Err(msg.reason));
                }
            }
            MessageType::ChannelData => {
                let msg = ChannelData::decode(frame)?;
                if let Some(channel) = self.lookup(msg.recipient_channel, "data") {
                    let len = msg.data.len();
                    if let Err(err) = channel.send_data(msg.data) {
                        tracing::debug!(channel = msg.recipient_channel, len, error = %err, "channel data dropped");
                    }
                }
            }
            MessageType::ChannelWindowAdjust => {
                let msg = ChannelWindowAdjust::decode(frame)?;
                if let Some(channel) = self.lookup(msg.recipient_channel, "window adjust") {
                    channel.send_window_adjust(msg.bytes_to_add);
                }
            }
            MessageType::ChannelClose => {
                let msg = ChannelClose::decode(frame)?;
                if let Some(channel) = self.lookup(msg.recipient_channel, "close") {
                    channel.mark_closed();
                }
            }
            other => {
                tracing::debug!(message_type = other.as_byte(), "not a channel frame");
            }
        }
        Ok(())
    }

    fn lookup(&self, sender_channel: u32, what: &'static str) -> Option<Arc<Channel>> {
        let channel = self.get(sender_channel);
        if channel.is_none() {
            tracing::warn!(channel = sender_channel, frame = what, "frame for unknown channel");
        }
        channel
    }
}

impl ChannelManager for ChannelStore {
    type Channel = Channel;

    fn register_channel(&self) -> Result<Arc<Channel>, ChannelError> {
        self.register()
    }

    fn unregister_channel(&self, sender_channel: u32) {
        self.unregister(sender_channel);
    }

    fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::channel::{ChannelState, CiraChannel};

    fn store() -> ChannelStore {
        let (client, _server) = tokio::io::duplex(1024);
        ChannelStore::new(Arc::new(Connection::new(client)), &TunnelConfig::default())
    }

    #[test]
    fn ids_increase_and_are_not_reused() {
        let store = store();
        let a = store.register().unwrap();
        let b = store.register().unwrap();
        assert_eq!((a.sender_channel(), b.sender_channel()), (1, 2));
        store.unregister(1);
        let c = store.register().unwrap();
        assert_eq!(c.sender_channel(), 3);
        assert_eq!(store.len(), 2);
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn dispatch_routes_by_recipient_channel() {
        let store = store();
        let first = store.register().unwrap();
        let second = store.register().unwrap();

        let confirm = ChannelOpenConfirmation {
            recipient_channel: 2,
            sender_channel: 40,
            initial_window: 1000,
        };
        store.dispatch(&confirm.encode()).await.unwrap();
        assert_eq!(second.state(), ChannelState::Open);
        assert_eq!(second.recipient_channel(), 40);
        assert_eq!(first.state(), ChannelState::Unopened);

        store
            .dispatch(&ChannelData::encode_slice(2, b"payload"))
            .await
            .unwrap();
        let data = second.receive_data(Duration::from_millis(10)).await.unwrap();
        assert_eq!(data, Bytes::from_static(b"payload"));

        let adjust = ChannelWindowAdjust {
            recipient_channel: 2,
            bytes_to_add: 24,
        };
        store.dispatch(&adjust.encode()).await.unwrap();
        assert_eq!(second.tx_window(), 1024);

        store
            .dispatch(&ChannelClose { recipient_channel: 2 }.encode())
            .await
            .unwrap();
        assert!(second.is_closed());
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn slow_consumer_does_not_stall_other_channels() {
        let (client, _server) = tokio::io::duplex(1024);
        let config = TunnelConfig {
            data_queue_depth: 1,
            ..TunnelConfig::default()
        };
        let store = ChannelStore::new(Arc::new(Connection::new(client)), &config);
        let slow = store.register().unwrap();
        let other = store.register().unwrap();

        store.dispatch(&ChannelData::encode_slice(1, b"one")).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            store.dispatch(&ChannelData::encode_slice(1, b"two")),
        )
        .await
        .expect("dispatch waited on a full queue")
        .unwrap();
        assert!(slow.is_closed());

        store.dispatch(&ChannelData::encode_slice(2, b"fine")).await.unwrap();
        let data = other.receive_data(Duration::from_millis(10)).await.unwrap();
        assert_eq!(&data[..], b"fine");
        assert!(!other.is_closed());

        store.unregister(1);
        let data = slow.receive_data(Duration::from_millis(10)).await.unwrap();
        assert_eq!(&data[..], b"one");
    }

    #[tokio::test]
    async fn unknown_channel_is_ignored() {
        let store = store();
        store
            .dispatch(&ChannelData::encode_slice(9, b"x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error() {
        let store = store();
        assert!(store.dispatch(&[MessageType::ChannelData.as_byte(), 0, 0]).await.is_err());
    }

    #[test]
    fn concurrent_registration_yields_unique_ids() {
        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| store.register().unwrap().sender_channel())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }
}
