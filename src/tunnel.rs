//! Inbound side of one physical tunnel connection.
//!
//! [`Tunnel::run`] reads the socket, splits it into APF frames, and routes
//! each one: channel frames addressed to any channel other than
//! [`LEGACY_SENDER_CHANNEL`] go to the [`ChannelStore`], everything else goes
//! through the [`Processor`] against the legacy [`Session`]. Replies are
//! written through the shared [`Connection`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;
use tracing::{Instrument, Span};

use crate::channel::{write_windowed, ChannelError, ChannelManager, ChannelState, ChannelStore};
use crate::config::TunnelConfig;
use crate::connection::Connection;
use crate::framing::{ApfCodec, CodecError};
use crate::handler::Handler;
use crate::messages::{peek_type, KeepAliveOptions, MessageType, UserAuthFailure};
use crate::processor::Processor;
use crate::session::Session;

/// Channel number of the legacy session. Multiplexed channels start at 1.
pub const LEGACY_SENDER_CHANNEL: u32 = 0;

const READ_BUFFER: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("framing error: {0}")]
    Framing(#[from] CodecError),
    #[error("connection read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("connection write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

pub struct Tunnel<H: Handler> {
    store: Arc<ChannelStore>,
    processor: Processor<H>,
    session: Session,
    config: TunnelConfig,
    span: Span,
}

impl<H: Handler> Tunnel<H> {
    pub fn new(store: Arc<ChannelStore>, handler: H, config: TunnelConfig) -> Self {
        let span = tracing::debug_span!("apf_tunnel");
        Self {
            processor: Processor::new(handler)
                .with_trigger_reason(config.trigger_reason)
                .with_span(tracing::debug_span!(parent: &span, "apf_processor")),
            session: Session::new(LEGACY_SENDER_CHANNEL, &config),
            store,
            config,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.processor = self
            .processor
            .with_span(tracing::debug_span!(parent: &span, "apf_processor"));
        self.span = span;
        self
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn processor(&self) -> &Processor<H> {
        &self.processor
    }

    fn connection(&self) -> &Arc<Connection> {
        self.store.connection()
    }

    /// Reads and dispatches frames until the peer closes the stream or the
    /// stream becomes unusable. Every channel is closed on the way out.
    pub async fn run<R>(&self, reader: R) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.read_loop(reader).instrument(self.span.clone()).await;
        self.store.close_all();
        self.session.close();
        if let Err(err) = self.connection().shutdown().await {
            tracing::debug!(parent: &self.span, error = %err, "connection shutdown failed");
        }
        if let Err(err) = &result {
            tracing::warn!(parent: &self.span, error = %err, "tunnel stopped");
        }
        result
    }

    async fn read_loop<R>(&self, mut reader: R) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
    {
        let mut codec = ApfCodec::new(self.config.max_inbound_frame);
        let mut buf = BytesMut::with_capacity(READ_BUFFER);
        loop {
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => self.handle_frame(&frame).await?,
                    Ok(None) => break,
                    Err(err) => {
                        self.reject_undecodable(&buf, &err).await;
                        return Err(err.into());
                    }
                }
            }
            let read = reader.read_buf(&mut buf).await.map_err(TunnelError::Read)?;
            if read == 0 {
                if !buf.is_empty() {
                    tracing::warn!(len = buf.len(), "connection closed mid-frame");
                }
                tracing::info!("connection closed by peer");
                return Ok(());
            }
        }
    }

    /// An auth request that cannot be framed still gets an explicit failure
    /// before the stream is dropped.
    async fn reject_undecodable(&self, buf: &[u8], err: &CodecError) {
        let is_auth = buf.first() == Some(&MessageType::UserAuthRequest.as_byte());
        if !is_auth || !matches!(err, CodecError::Decode(_)) {
            return;
        }
        if let Err(err) = self.write(&UserAuthFailure::default().encode()).await {
            tracing::debug!(error = %err, "failed to reject undecodable auth request");
        }
    }

    /// Routes one whole frame and writes whatever reply it produces.
    pub async fn handle_frame(&self, frame: &[u8]) -> Result<(), TunnelError> {
        let Ok(kind) = peek_type(frame) else {
            tracing::warn!(len = frame.len(), "dropping unrecognised frame");
            return Ok(());
        };
        if kind.is_channel_scoped() {
            if let Some(recipient) = recipient_channel(frame) {
                if recipient != LEGACY_SENDER_CHANNEL {
                    if let Err(err) = self.store.dispatch(frame).await {
                        tracing::warn!(channel = recipient, error = %err, "dropping malformed channel frame");
                    }
                    return Ok(());
                }
            }
        }

        let outcome = self.processor.process_frame(frame, &self.session);
        if let Some(reply) = outcome.reply {
            self.write(&reply).await?;
        }
        if outcome.send_keepalive_options {
            let options = KeepAliveOptions {
                interval_secs: self.config.keepalive_interval_secs,
                timeout_secs: self.config.keepalive_timeout_secs,
            };
            self.write(&options.encode_request()).await?;
        }
        if kind == MessageType::ChannelData {
            if let Some(credit) = self.session.window_credit() {
                self.write(&credit).await?;
            }
        }
        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TunnelError> {
        self.connection()
            .write_frame(frame)
            .await
            .map_err(TunnelError::Write)
    }

    /// Sends `payload` over the legacy session, opening a fresh one first
    /// unless it is already open, and returns what the peer sent back once it
    /// has gone quiet.
    ///
    /// `run` must be driving the read side concurrently.
    pub async fn forward(&self, payload: &[u8]) -> Result<Bytes, TunnelError> {
        if self.session.state() != ChannelState::Open {
            self.session.restart();
            let open = self.session.open_request(&self.config);
            self.write(&open).await?;
            self.session.wait_for_open(self.config.open_timeout()).await?;
        }
        let channel = self.session.channel();
        write_windowed(
            &*channel,
            self.connection(),
            payload,
            self.config.max_frame_size as usize,
            self.config.window_timeout(),
        )
        .await?;
        channel.touch();
        let data = self
            .session
            .wait_for_quiet(self.config.quiet_period(), self.config.response_timeout())
            .await?;
        tracing::debug!(sent = payload.len(), received = data.len(), "session exchange complete");
        Ok(data)
    }
}

fn recipient_channel(frame: &[u8]) -> Option<u32> {
    let bytes = frame.get(1..5)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
