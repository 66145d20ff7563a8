//! HTTP request/response exchanges over multiplexed APF channels.
//!
//! Each [`CiraTransport::round_trip`] claims one of a fixed number of slots,
//! opens a fresh channel, pushes the serialized request through the peer's
//! send window, and collects the response until it looks complete. Every
//! wait is bounded by a timeout from [`TunnelConfig`].

use std::sync::Arc;

use bytes::BytesMut;
use http::{Request, Response};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{self, Instant};
use tracing::{Instrument, Span};

use crate::channel::{write_windowed, ChannelError, ChannelManager, CiraChannel};
use crate::config::TunnelConfig;
use crate::messages::{ChannelClose, ChannelOpen, ChannelWindowAdjust};

pub mod http1;

pub use http1::{encode_request, parse_response, response_complete, DEFAULT_CONTENT_TYPE};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("connection write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("peer closed the channel without responding")]
    EmptyResponse,
}

/// Unregisters the channel however the exchange ends.
struct Registration<'a, M: ChannelManager> {
    manager: &'a M,
    sender_channel: u32,
}

impl<M: ChannelManager> Drop for Registration<'_, M> {
    fn drop(&mut self) {
        self.manager.unregister_channel(self.sender_channel);
    }
}

pub struct CiraTransport<M: ChannelManager> {
    manager: Arc<M>,
    slots: Semaphore,
    config: TunnelConfig,
    span: Span,
}

impl<M: ChannelManager> CiraTransport<M> {
    pub fn new(manager: Arc<M>, config: TunnelConfig) -> Self {
        Self {
            slots: Semaphore::new(config.max_channels),
            manager,
            config,
            span: tracing::debug_span!("cira_transport"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Slots not currently held by an in-flight exchange.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Runs one HTTP exchange on its own channel.
    pub async fn round_trip(
        &self,
        request: Request<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>, TransportError> {
        let span = tracing::debug_span!(
            parent: &self.span,
            "round_trip",
            method = %request.method(),
            uri = %request.uri()
        );
        self.exchange(request).instrument(span).await
    }

    async fn exchange(
        &self,
        request: Request<Vec<u8>>,
    ) -> Result<Response<Vec<u8>>, TransportError> {
        let payload = encode_request(&request)?;
        let _permit = time::timeout(self.config.slot_timeout(), self.slots.acquire())
            .await
            .map_err(|_| TransportError::Timeout("channel slot"))?
            .map_err(|_| ChannelError::Closed)?;

        let channel = self.manager.register_channel()?;
        let _registration = Registration {
            manager: &*self.manager,
            sender_channel: channel.sender_channel(),
        };

        self.open(&*channel).await?;
        let received = match self.send(&*channel, &payload).await {
            Ok(()) => self.receive(&*channel).await,
            Err(err) => Err(err),
        };
        self.close(&*channel).await;

        let received = received?;
        if received.is_empty() {
            return Err(TransportError::EmptyResponse);
        }
        let response = parse_response(&received)?;
        tracing::debug!(status = %response.status(), len = received.len(), "exchange complete");
        Ok(response)
    }

    async fn open(&self, channel: &M::Channel) -> Result<(), TransportError> {
        let frame = ChannelOpen::forwarded_tcpip(
            channel.sender_channel(),
            self.config.rx_window_size,
            (&self.config.connected_address, self.config.connected_port),
            (&self.config.originator_address, self.config.originator_port),
        )
        .encode();
        channel.mark_opening();
        self.manager.connection().write_frame(&frame).await?;
        channel.wait_for_open(self.config.open_timeout()).await?;
        tracing::trace!(
            channel = channel.sender_channel(),
            peer = channel.recipient_channel(),
            window = channel.tx_window(),
            "channel opened"
        );
        Ok(())
    }

    async fn send(&self, channel: &M::Channel, payload: &[u8]) -> Result<(), TransportError> {
        write_windowed(
            channel,
            self.manager.connection(),
            payload,
            self.config.max_frame_size as usize,
            self.config.window_timeout(),
        )
        .await?;
        Ok(())
    }

    async fn receive(&self, channel: &M::Channel) -> Result<BytesMut, TransportError> {
        let deadline = Instant::now() + self.config.response_timeout();
        let mut received = BytesMut::new();
        while !response_complete(&received) {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout("response"));
            }
            let wait = self.config.poll_interval().min(deadline - now);
            match channel.receive_data(wait).await {
                Ok(data) => {
                    received.extend_from_slice(&data);
                    if let Some(bytes_to_add) = channel.take_rx_credit() {
                        let adjust = ChannelWindowAdjust {
                            recipient_channel: channel.recipient_channel(),
                            bytes_to_add,
                        };
                        self.manager.connection().write_frame(&adjust.encode()).await?;
                    }
                }
                Err(ChannelError::Timeout(_)) => {}
                Err(ChannelError::Closed) => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(received)
    }

    async fn close(&self, channel: &M::Channel) {
        if !channel.mark_close_sent() {
            return;
        }
        let frame = ChannelClose {
            recipient_channel: channel.recipient_channel(),
        }
        .encode();
        if let Err(err) = self.manager.connection().write_frame(&frame).await {
            tracing::warn!(channel = channel.sender_channel(), error = %err, "failed to send channel close");
        }
    }
}
