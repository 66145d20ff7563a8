//! Virtual channels carried over the tunnel connection.
//!
//! One [`Channel`] type backs both the legacy forwarding session and the
//! multiplexed HTTP exchanges. The mode only decides where inbound payload
//! goes: legacy channels accumulate it in one buffer and track inactivity,
//! multiplexed channels queue each slice for a consumer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::connection::Connection;
use crate::messages::{ChannelData, ChannelOpenConfirmation, OpenFailureReason};

pub mod store;
pub mod window;

pub use store::ChannelStore;
pub use window::{FlowWindow, ReceiveWindow};

const WINDOW_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Single forwarding channel driven by the protocol processor.
    Legacy,
    /// One of several channels owned by a [`ChannelStore`].
    Multiplexed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unopened,
    AwaitingConfirmation,
    Open,
    Closed,
}

/// Errors surfaced to whoever is driving a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("channel closed")]
    Closed,
    #[error("peer refused channel: {0}")]
    OpenFailed(OpenFailureReason),
    #[error("channel id space exhausted")]
    IdsExhausted,
    #[error("inbound queue full")]
    Overflow,
    #[error("connection write failed: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenOutcome {
    Pending,
    Confirmed,
    Refused(OpenFailureReason),
    Closed,
}

#[derive(Debug)]
struct ChannelInner {
    state: ChannelState,
    recipient_channel: u32,
    tx_window: FlowWindow,
    rx_window: ReceiveWindow,
    inbound: BytesMut,
    last_activity: Instant,
    close_sent: bool,
}

/// Per-channel state machine:
/// `Unopened -> AwaitingConfirmation -> Open -> Closed`, or straight to
/// `Closed` when the peer refuses.
#[derive(Debug)]
pub struct Channel {
    mode: ChannelMode,
    sender_channel: u32,
    inner: Mutex<ChannelInner>,
    open: watch::Sender<OpenOutcome>,
    data_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    data_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    window_tx: Mutex<Option<mpsc::Sender<u32>>>,
    window_rx: tokio::sync::Mutex<mpsc::Receiver<u32>>,
}

impl Channel {
    pub fn new(mode: ChannelMode, sender_channel: u32, rx_window: u32, queue_depth: usize) -> Self {
        let (open, _) = watch::channel(OpenOutcome::Pending);
        let (data_tx, data_rx) = mpsc::channel(queue_depth.max(1));
        let (window_tx, window_rx) = mpsc::channel(WINDOW_QUEUE_DEPTH);
        Self {
            mode,
            sender_channel,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Unopened,
                recipient_channel: 0,
                tx_window: FlowWindow::default(),
                rx_window: ReceiveWindow::new(rx_window),
                inbound: BytesMut::new(),
                last_activity: Instant::now(),
                close_sent: false,
            }),
            open,
            data_tx: Mutex::new(Some(data_tx)),
            data_rx: tokio::sync::Mutex::new(data_rx),
            window_tx: Mutex::new(Some(window_tx)),
            window_rx: tokio::sync::Mutex::new(window_rx),
        }
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn rx_window_remaining(&self) -> u32 {
        self.inner.lock().rx_window.remaining()
    }

    /// Applies the peer's confirmation and wakes the opener.
    pub fn confirm(&self, confirmation: &ChannelOpenConfirmation) {
        {
            let mut inner = self.inner.lock();
            if inner.state == ChannelState::Closed {
                return;
            }
            inner.recipient_channel = confirmation.sender_channel;
            inner.tx_window.reset(confirmation.initial_window);
        }
        self.signal_open(Ok(()));
    }

    /// Records the open outcome. Only the first outcome is kept.
    pub fn signal_open(&self, outcome: Result<(), OpenFailureReason>) {
        let next = match outcome {
            Ok(()) => OpenOutcome::Confirmed,
            Err(reason) => OpenOutcome::Refused(reason),
        };
        let accepted = self.open.send_if_modified(|current| {
            if *current != OpenOutcome::Pending {
                return false;
            }
            *current = next;
            true
        });
        if !accepted {
            return;
        }
        match outcome {
            Ok(()) => {
                self.inner.lock().state = ChannelState::Open;
                tracing::debug!(channel = self.sender_channel, "channel open");
            }
            Err(reason) => {
                tracing::warn!(channel = self.sender_channel, %reason, "channel open refused");
                self.mark_closed();
            }
        }
    }

    /// Queues (multiplexed) or accumulates (legacy) inbound payload.
    ///
    /// Never waits: a multiplexed channel whose queue is full is closed, and
    /// whatever was already queued stays readable.
    pub fn send_data(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.mode == ChannelMode::Legacy {
            self.accumulate(&data);
            return Ok(());
        }
        let result = match self.data_tx.lock().as_ref() {
            Some(sender) => sender.try_send(data),
            None => return Err(ChannelError::Closed),
        };
        match result {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
            Err(mpsc::error::TrySendError::Full(data)) => {
                tracing::warn!(
                    channel = self.sender_channel,
                    len = data.len(),
                    "inbound queue full, closing channel"
                );
                self.mark_closed();
                Err(ChannelError::Overflow)
            }
        }
    }

    /// Appends to the inbound buffer and restarts the inactivity clock.
    pub fn accumulate(&self, data: &[u8]) {
        let mut inner = self.inner.lock();
        inner.inbound.extend_from_slice(data);
        inner.rx_window.record(data.len() as u32);
        inner.last_activity = Instant::now();
    }

    pub fn take_inbound(&self) -> Bytes {
        self.inner.lock().inbound.split().freeze()
    }

    pub fn inbound_len(&self) -> usize {
        self.inner.lock().inbound.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Restarts the inactivity clock without inbound data.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    /// Grants send credit from an inbound window-adjust and notifies any
    /// writer blocked on an empty window.
    pub fn send_window_adjust(&self, bytes: u32) {
        self.inner.lock().tx_window.grant(bytes);
        if let Some(tx) = self.window_tx.lock().as_ref() {
            // A full queue already holds a wake-up; the credit is counted above.
            let _ = tx.try_send(bytes);
        }
    }

    /// Moves to `Closed`, ends both inbound queues, and fails a pending open.
    pub fn mark_closed(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.state, ChannelState::Closed)
        };
        self.data_tx.lock().take();
        self.window_tx.lock().take();
        self.open.send_if_modified(|current| {
            if *current != OpenOutcome::Pending {
                return false;
            }
            *current = OpenOutcome::Closed;
            true
        });
        if previous != ChannelState::Closed {
            tracing::debug!(channel = self.sender_channel, "channel closed");
        }
    }
}

/// Channel operations the CIRA transport relies on.
#[async_trait]
pub trait CiraChannel: Send + Sync {
    fn sender_channel(&self) -> u32;
    fn recipient_channel(&self) -> u32;
    fn set_recipient_channel(&self, recipient_channel: u32);
    fn tx_window(&self) -> u32;
    fn set_tx_window(&self, credit: u32);
    fn add_tx_window(&self, bytes: u32);
    /// Deducts sent bytes, clamped at zero. Returns the amount deducted.
    fn consume_tx_window(&self, bytes: u32) -> u32;
    /// Receive credit to hand back to the peer, once enough is consumed.
    fn take_rx_credit(&self) -> Option<u32>;
    /// Records that our channel-open has been written.
    fn mark_opening(&self);
    /// Returns `true` the first time only, so close is sent once.
    fn mark_close_sent(&self) -> bool;
    async fn wait_for_open(&self, timeout: Duration) -> Result<(), ChannelError>;
    async fn receive_data(&self, timeout: Duration) -> Result<Bytes, ChannelError>;
    async fn receive_window_adjust(&self, timeout: Duration) -> Result<u32, ChannelError>;
    fn is_closed(&self) -> bool;
}

#[async_trait]
impl CiraChannel for Channel {
    fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    fn recipient_channel(&self) -> u32 {
        self.inner.lock().recipient_channel
    }

    fn set_recipient_channel(&self, recipient_channel: u32) {
        self.inner.lock().recipient_channel = recipient_channel;
    }

    fn tx_window(&self) -> u32 {
        self.inner.lock().tx_window.credit()
    }

    fn set_tx_window(&self, credit: u32) {
        self.inner.lock().tx_window.reset(credit);
    }

    fn add_tx_window(&self, bytes: u32) {
        self.inner.lock().tx_window.grant(bytes);
    }

    fn consume_tx_window(&self, bytes: u32) -> u32 {
        self.inner.lock().tx_window.consume(bytes)
    }

    fn take_rx_credit(&self) -> Option<u32> {
        self.inner.lock().rx_window.take_credit()
    }

    fn mark_opening(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Unopened {
            inner.state = ChannelState::AwaitingConfirmation;
        }
    }

    fn mark_close_sent(&self) -> bool {
        let mut inner = self.inner.lock();
        !std::mem::replace(&mut inner.close_sent, true)
    }

    async fn wait_for_open(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut rx = self.open.subscribe();
        let outcome = match time::timeout(timeout, rx.wait_for(|o| *o != OpenOutcome::Pending)).await
        {
            Ok(Ok(outcome)) => *outcome,
            Ok(Err(_)) => OpenOutcome::Closed,
            Err(_) => return Err(ChannelError::Timeout("open confirmation")),
        };
        match outcome {
            OpenOutcome::Confirmed => Ok(()),
            OpenOutcome::Refused(reason) => Err(ChannelError::OpenFailed(reason)),
            OpenOutcome::Pending | OpenOutcome::Closed => Err(ChannelError::Closed),
        }
    }

    async fn receive_data(&self, timeout: Duration) -> Result<Bytes, ChannelError> {
        let received = time::timeout(timeout, async { self.data_rx.lock().await.recv().await })
            .await
            .map_err(|_| ChannelError::Timeout("channel data"))?;
        let data = received.ok_or(ChannelError::Closed)?;
        self.inner.lock().rx_window.record(data.len() as u32);
        Ok(data)
    }

    async fn receive_window_adjust(&self, timeout: Duration) -> Result<u32, ChannelError> {
        time::timeout(timeout, async { self.window_rx.lock().await.recv().await })
            .await
            .map_err(|_| ChannelError::Timeout("window adjust"))?
            .ok_or(ChannelError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().state == ChannelState::Closed
    }
}

/// Writes `payload` as channel-data frames sized to the smaller of the
/// peer's current window and `max_frame`, waiting up to `window_timeout`
/// for credit whenever the window is empty.
pub async fn write_windowed<C>(
    channel: &C,
    connection: &Connection,
    payload: &[u8],
    max_frame: usize,
    window_timeout: Duration,
) -> Result<(), ChannelError>
where
    C: CiraChannel + ?Sized,
{
    let mut remaining = payload;
    while !remaining.is_empty() {
        if channel.is_closed() {
            return Err(ChannelError::Closed);
        }
        if channel.tx_window() == 0 {
            tracing::trace!(channel = channel.sender_channel(), "send window exhausted");
            channel.receive_window_adjust(window_timeout).await?;
            continue;
        }
        let want = remaining.len().min(max_frame).min(u32::MAX as usize) as u32;
        let len = channel.consume_tx_window(want) as usize;
        if len == 0 {
            continue;
        }
        let frame = ChannelData::encode_slice(channel.recipient_channel(), &remaining[..len]);
        connection.write_frame(&frame).await?;
        remaining = &remaining[len..];
    }
    Ok(())
}

/// Registry seam between the transport and the channel layer.
pub trait ChannelManager: Send + Sync {
    type Channel: CiraChannel + 'static;

    fn register_channel(&self) -> Result<Arc<Self::Channel>, ChannelError>;
    fn unregister_channel(&self, sender_channel: u32);
    fn connection(&self) -> &Arc<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multiplexed() -> Channel {
        Channel::new(ChannelMode::Multiplexed, 1, 4096, 8)
    }

    #[tokio::test]
    async fn confirmation_opens_and_sets_peer_fields() {
        let channel = multiplexed();
        channel.mark_opening();
        assert_eq!(channel.state(), ChannelState::AwaitingConfirmation);
        channel.confirm(&ChannelOpenConfirmation {
            recipient_channel: 1,
            sender_channel: 77,
            initial_window: 2048,
        });
        channel.wait_for_open(Duration::from_millis(10)).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.recipient_channel(), 77);
        assert_eq!(channel.tx_window(), 2048);
    }

    #[tokio::test]
    async fn refusal_is_reported_and_closes() {
        let channel = multiplexed();
        channel.signal_open(Err(OpenFailureReason::ResourceShortage));
        let err = channel.wait_for_open(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::OpenFailed(OpenFailureReason::ResourceShortage)
        ));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn first_open_outcome_wins() {
        let channel = multiplexed();
        channel.signal_open(Ok(()));
        channel.signal_open(Err(OpenFailureReason::ConnectFailed));
        assert!(channel.wait_for_open(Duration::from_millis(10)).await.is_ok());
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn wait_for_open_times_out() {
        let channel = multiplexed();
        let err = channel.wait_for_open(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[tokio::test]
    async fn close_drains_then_reports_closed() {
        let channel = multiplexed();
        channel.send_data(Bytes::from_static(b"abc")).unwrap();
        channel.mark_closed();
        let data = channel.receive_data(Duration::from_millis(10)).await.unwrap();
        assert_eq!(&data[..], b"abc");
        assert!(matches!(
            channel.receive_data(Duration::from_millis(10)).await,
            Err(ChannelError::Closed)
        ));
        assert!(matches!(
            channel.send_data(Bytes::from_static(b"late")),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn full_queue_closes_instead_of_waiting() {
        let channel = Channel::new(ChannelMode::Multiplexed, 1, 4096, 1);
        channel.send_data(Bytes::from_static(b"one")).unwrap();
        assert!(matches!(
            channel.send_data(Bytes::from_static(b"two")),
            Err(ChannelError::Overflow)
        ));
        assert!(channel.is_closed());
        let data = channel.receive_data(Duration::from_millis(10)).await.unwrap();
        assert_eq!(&data[..], b"one");
        assert!(matches!(
            channel.receive_data(Duration::from_millis(10)).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_wakes_pending_open() {
        let channel = Arc::new(multiplexed());
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.wait_for_open(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        channel.mark_closed();
        assert!(matches!(waiter.await.unwrap(), Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn window_adjust_grants_and_notifies() {
        let channel = multiplexed();
        channel.send_window_adjust(512);
        assert_eq!(channel.tx_window(), 512);
        assert_eq!(
            channel
                .receive_window_adjust(Duration::from_millis(10))
                .await
                .unwrap(),
            512
        );
        assert_eq!(channel.consume_tx_window(600), 512);
        assert_eq!(channel.tx_window(), 0);
    }

    #[test]
    fn legacy_mode_accumulates_inbound() {
        let channel = Channel::new(ChannelMode::Legacy, 1, 100, 1);
        channel.accumulate(b"hello ");
        channel.accumulate(b"world");
        assert_eq!(channel.inbound_len(), 11);
        assert_eq!(channel.rx_window_remaining(), 89);
        assert_eq!(&channel.take_inbound()[..], b"hello world");
        assert_eq!(channel.inbound_len(), 0);
    }

    #[tokio::test]
    async fn windowed_write_waits_for_credit() {
        use tokio::io::AsyncReadExt;

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let connection = Connection::new(client);
        let channel = Arc::new(multiplexed());
        channel.confirm(&ChannelOpenConfirmation {
            recipient_channel: 1,
            sender_channel: 9,
            initial_window: 4,
        });
        let granter = {
            let channel = channel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                channel.send_window_adjust(100);
            })
        };
        write_windowed(&*channel, &connection, b"0123456789", 3, Duration::from_secs(1))
            .await
            .unwrap();
        granter.await.unwrap();

        // 3 + 1 from the initial window, then 3 + 3 after the grant.
        let mut frames = vec![0u8; 4 * 9 + 10];
        server.read_exact(&mut frames).await.unwrap();
        assert_eq!(&frames[1..5], &9u32.to_be_bytes());
        assert_eq!(&frames[9..12], b"012");
        assert_eq!(channel.tx_window(), 94);
    }

    #[tokio::test]
    async fn windowed_write_times_out_without_credit() {
        let (client, _server) = tokio::io::duplex(1024);
        let connection = Connection::new(client);
        let channel = multiplexed();
        let err = write_windowed(&channel, &connection, b"data", 16, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }

    #[test]
    fn peer_fields_can_be_set_directly() {
        let channel = multiplexed();
        channel.set_recipient_channel(12);
        channel.set_tx_window(100);
        channel.add_tx_window(u32::MAX);
        assert_eq!(channel.recipient_channel(), 12);
        assert_eq!(channel.tx_window(), u32::MAX);
        assert_eq!(channel.mode(), ChannelMode::Multiplexed);
    }

    #[test]
    fn close_is_sent_once() {
        let channel = multiplexed();
        assert!(channel.mark_close_sent());
        assert!(!channel.mark_close_sent());
    }
}
