use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{self, Instant};

use crate::channel::{Channel, ChannelError, ChannelMode, ChannelState, CiraChannel};
use crate::config::TunnelConfig;
use crate::messages::{
    ChannelOpen, ChannelOpenConfirmation, ChannelWindowAdjust, OpenFailureReason,
};

/// State of the single legacy forwarding channel on a connection.
///
/// A session lives for one forwarding exchange: the caller writes
/// [`Session::open_request`], waits with [`Session::wait_for_open`], and the
/// protocol processor feeds confirmations, data, window adjusts and close
/// into it. Inbound payload accumulates until the peer goes quiet. Once the
/// channel has closed, [`Session::restart`] starts the next exchange on a
/// fresh one.
#[derive(Debug)]
pub struct Session {
    sender_channel: u32,
    rx_window_size: u32,
    channel: Mutex<Arc<Channel>>,
}

impl Session {
    pub fn new(sender_channel: u32, config: &TunnelConfig) -> Self {
        Self {
            sender_channel,
            rx_window_size: config.rx_window_size,
            channel: Mutex::new(Arc::new(Self::fresh(sender_channel, config.rx_window_size))),
        }
    }

    fn fresh(sender_channel: u32, rx_window_size: u32) -> Channel {
        Channel::new(ChannelMode::Legacy, sender_channel, rx_window_size, 1)
    }

    /// The channel backing the current exchange.
    pub fn channel(&self) -> Arc<Channel> {
        self.channel.lock().clone()
    }

    /// Discards the current channel, closing it if it is still live, and
    /// starts over from `Unopened`.
    pub fn restart(&self) {
        let fresh = Arc::new(Self::fresh(self.sender_channel, self.rx_window_size));
        let previous = std::mem::replace(&mut *self.channel.lock(), fresh);
        previous.mark_closed();
        tracing::debug!(channel = self.sender_channel, "legacy session restarted");
    }

    /// Builds the channel-open frame and marks the session as awaiting
    /// confirmation.
    pub fn open_request(&self, config: &TunnelConfig) -> Vec<u8> {
        self.channel().mark_opening();
        ChannelOpen::forwarded_tcpip(
            self.sender_channel(),
            config.rx_window_size,
            (&config.connected_address, config.connected_port),
            (&config.originator_address, config.originator_port),
        )
        .encode()
    }

    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Peer-assigned channel; zero until confirmed.
    pub fn recipient_channel(&self) -> u32 {
        self.channel().recipient_channel()
    }

    pub fn tx_window(&self) -> u32 {
        self.channel().tx_window()
    }

    pub fn rx_window(&self) -> u32 {
        self.channel().rx_window_remaining()
    }

    pub fn state(&self) -> ChannelState {
        self.channel().state()
    }

    pub fn is_closed(&self) -> bool {
        self.channel().is_closed()
    }

    pub(crate) fn confirm_open(&self, confirmation: &ChannelOpenConfirmation) {
        self.channel().confirm(confirmation);
    }

    pub(crate) fn refuse_open(&self, reason: OpenFailureReason) {
        self.channel().signal_open(Err(reason));
    }

    pub(crate) fn append_inbound(&self, data: &[u8]) {
        self.channel().accumulate(data);
    }

    pub(crate) fn grant_tx_window(&self, bytes: u32) {
        self.channel().send_window_adjust(bytes);
    }

    pub(crate) fn close(&self) {
        self.channel().mark_closed();
    }

    pub async fn wait_for_open(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.channel().wait_for_open(timeout).await
    }

    /// Takes everything accumulated so far.
    pub fn take_inbound(&self) -> Bytes {
        self.channel().take_inbound()
    }

    /// Waits until no data has arrived for `quiet`, then takes the
    /// accumulated payload. Returns early if the channel closes.
    pub async fn wait_for_quiet(&self, quiet: Duration, limit: Duration) -> Result<Bytes, ChannelError> {
        let deadline = Instant::now() + limit;
        loop {
            let quiet_at = self.channel().last_activity() + quiet;
            let now = Instant::now();
            if now >= quiet_at || self.is_closed() {
                return Ok(self.take_inbound());
            }
            if now >= deadline {
                return Err(ChannelError::Timeout("quiet period"));
            }
            time::sleep_until(quiet_at.min(deadline)).await;
        }
    }

    /// Window-adjust frame returning consumed receive credit, once at least
    /// half the window has been used.
    pub fn window_credit(&self) -> Option<Vec<u8>> {
        let bytes_to_add = self.channel().take_rx_credit()?;
        Some(
            ChannelWindowAdjust {
                recipient_channel: self.recipient_channel(),
                bytes_to_add,
            }
            .encode(),
        )
    }
}
