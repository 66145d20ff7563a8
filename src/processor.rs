//! Connection-level APF message dispatch.
//!
//! [`Processor`] takes one framed message at a time, applies it to the
//! legacy [`Session`], consults the [`Handler`] where policy is needed, and
//! returns at most one reply frame. Malformed input is logged and dropped,
//! with two deliberate exceptions: a user-auth request that fails to decode
//! is answered with an explicit auth failure, and a protocol version the
//! handler rejects is answered with nothing at all.

use tracing::Span;

use crate::guid::{bytes_to_hex, guid_from_wire};
use crate::handler::{Handler, NoopHandler, ProtocolVersionInfo};
use crate::messages::{
    encode_request_failure, encode_request_success, encode_user_auth_success, peek_type,
    AuthRequest, ChannelClose, ChannelData, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelWindowAdjust, DecodeError, Disconnect, GlobalRequest, KeepAliveOptions,
    KeepAliveReply, KeepAliveRequest, MessageType, ProtocolVersion, ServiceAccept,
    ServiceRequest, TcpForwardReply, UserAuthFailure, GLOBAL_REQUEST_CANCEL_TCP_FORWARD,
    GLOBAL_REQUEST_TCP_FORWARD, SERVICE_AUTH, SERVICE_NAME_LEN, SERVICE_PFWD,
};
use crate::session::Session;

/// Result of processing one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub reply: Option<Vec<u8>>,
    /// Set when the handler asked for a keep-alive options request to follow
    /// a global request. The processor never sends it itself.
    pub send_keepalive_options: bool,
}

impl ProcessOutcome {
    fn reply(bytes: Vec<u8>) -> Self {
        Self {
            reply: Some(bytes),
            send_keepalive_options: false,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// Our side of the protocol version exchange.
const PROTOCOL_MAJOR_VERSION: u32 = 1;
const PROTOCOL_MINOR_VERSION: u32 = 0;

pub struct Processor<H = NoopHandler> {
    handler: H,
    trigger_reason: u32,
    span: Span,
}

impl Default for Processor<NoopHandler> {
    fn default() -> Self {
        Self::new(NoopHandler)
    }
}

impl<H: Handler> Processor<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            trigger_reason: 9,
            span: tracing::debug_span!("apf_processor"),
        }
    }

    /// Attaches the span every log line from this processor is recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_trigger_reason(mut self, trigger_reason: u32) -> Self {
        self.trigger_reason = trigger_reason;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Processes one frame and returns the reply bytes, empty when there is
    /// nothing to send.
    pub fn process(&self, frame: &[u8], session: &Session) -> Vec<u8> {
        self.process_frame(frame, session).reply.unwrap_or_default()
    }

    pub fn process_frame(&self, frame: &[u8], session: &Session) -> ProcessOutcome {
        let _entered = self.span.enter();
        let kind = match peek_type(frame) {
            Ok(kind) => kind,
            Err(err) => {
                let head = &frame[..frame.len().min(16)];
                tracing::warn!(error = %err, head = %bytes_to_hex(head), "dropping unrecognised frame");
                return ProcessOutcome::none();
            }
        };
        tracing::trace!(message_type = kind.as_byte(), len = frame.len(), "processing frame");
        let result = match kind {
            MessageType::KeepAliveRequest => self.keepalive_request(frame),
            MessageType::KeepAliveReply => KeepAliveReply::decode(frame).map(|reply| {
                tracing::trace!(cookie = reply.cookie, "keep-alive reply");
                ProcessOutcome::none()
            }),
            MessageType::KeepAliveOptionsReply => {
                KeepAliveOptions::decode(MessageType::KeepAliveOptionsReply, frame).map(|opts| {
                    tracing::debug!(
                        interval_secs = opts.interval_secs,
                        timeout_secs = opts.timeout_secs,
                        "keep-alive options accepted"
                    );
                    ProcessOutcome::none()
                })
            }
            MessageType::GlobalRequest => self.global_request(frame),
            MessageType::ChannelOpenConfirmation => {
                ChannelOpenConfirmation::decode(frame).map(|msg| {
                    session.confirm_open(&msg);
                    ProcessOutcome::none()
                })
            }
            MessageType::ChannelOpenFailure => ChannelOpenFailure::decode(frame).map(|msg| {
                session.refuse_open(msg.reason);
                ProcessOutcome::none()
            }),
            MessageType::ChannelData => ChannelData::decode(frame).map(|msg| {
                session.append_inbound(&msg.data);
                ProcessOutcome::none()
            }),
            MessageType::ChannelWindowAdjust => ChannelWindowAdjust::decode(frame).map(|msg| {
                session.grant_tx_window(msg.bytes_to_add);
                ProcessOutcome::none()
            }),
            MessageType::ChannelClose => ChannelClose::decode(frame).map(|msg| {
                let recipient_channel = match session.recipient_channel() {
                    0 => msg.recipient_channel,
                    peer => peer,
                };
                session.close();
                ProcessOutcome::reply(ChannelClose { recipient_channel }.encode())
            }),
            MessageType::ServiceRequest => self.service_request(frame),
            MessageType::ProtocolVersion => self.protocol_version(frame),
            MessageType::UserAuthRequest => Ok(self.user_auth_request(frame)),
            MessageType::Disconnect => Disconnect::decode(frame).map(|msg| {
                tracing::info!(reason_code = msg.reason_code, "peer disconnected");
                session.close();
                ProcessOutcome::none()
            }),
            other => {
                tracing::debug!(message_type = other.as_byte(), "unexpected message ignored");
                Ok(ProcessOutcome::none())
            }
        };
        result.unwrap_or_else(|err| {
            tracing::warn!(message_type = kind.as_byte(), error = %err, "dropping malformed frame");
            ProcessOutcome::none()
        })
    }

    fn keepalive_request(&self, frame: &[u8]) -> Result<ProcessOutcome, DecodeError> {
        let request = KeepAliveRequest::decode(frame)?;
        Ok(ProcessOutcome::reply(
            KeepAliveReply {
                cookie: request.cookie,
            }
            .encode(),
        ))
    }

    fn global_request(&self, frame: &[u8]) -> Result<ProcessOutcome, DecodeError> {
        let request = GlobalRequest::decode(frame)?;
        if request.request.is_empty() {
            tracing::debug!("global request without request string");
            return Ok(ProcessOutcome::none());
        }
        let send_keepalive_options = self.handler.on_global_request(&request);
        let reply = match request.request.as_str() {
            GLOBAL_REQUEST_TCP_FORWARD => {
                tracing::info!(address = %request.address, port = request.port, "tcp forward requested");
                Some(
                    TcpForwardReply {
                        port_bound: request.port,
                    }
                    .encode(),
                )
            }
            GLOBAL_REQUEST_CANCEL_TCP_FORWARD => {
                tracing::info!(address = %request.address, port = request.port, "tcp forward cancelled");
                Some(encode_request_success())
            }
            other => {
                tracing::debug!(request = other, "unsupported global request");
                request.want_reply.then(encode_request_failure)
            }
        };
        Ok(ProcessOutcome {
            reply,
            send_keepalive_options,
        })
    }

    fn service_request(&self, frame: &[u8]) -> Result<ProcessOutcome, DecodeError> {
        let request = ServiceRequest::decode(frame)?;
        let known = request.service_name.len() == SERVICE_NAME_LEN
            && (request.service_name == SERVICE_PFWD || request.service_name == SERVICE_AUTH);
        if !known {
            tracing::debug!(service = %request.service_name, "unknown service requested");
            return Ok(ProcessOutcome::none());
        }
        tracing::debug!(service = %request.service_name, "service accepted");
        Ok(ProcessOutcome::reply(
            ServiceAccept {
                service_name: request.service_name,
            }
            .encode(),
        ))
    }

    fn protocol_version(&self, frame: &[u8]) -> Result<ProcessOutcome, DecodeError> {
        let version = ProtocolVersion::decode(frame)?;
        let info = ProtocolVersionInfo {
            major_version: version.major_version,
            minor_version: version.minor_version,
            trigger_reason: version.trigger_reason,
            system_uuid: guid_from_wire(&version.uuid),
        };
        if let Err(err) = self.handler.on_protocol_version(&info) {
            tracing::warn!(uuid = %info.system_uuid, error = %err, "protocol version rejected");
            return Ok(ProcessOutcome::none());
        }
        tracing::info!(
            major = info.major_version,
            minor = info.minor_version,
            uuid = %info.system_uuid,
            "protocol version accepted"
        );
        Ok(ProcessOutcome::reply(
            ProtocolVersion {
                major_version: PROTOCOL_MAJOR_VERSION,
                minor_version: PROTOCOL_MINOR_VERSION,
                trigger_reason: self.trigger_reason,
                uuid: [0; 16],
            }
            .encode(),
        ))
    }

    fn user_auth_request(&self, frame: &[u8]) -> ProcessOutcome {
        let request = match AuthRequest::decode(frame) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "malformed user auth request");
                return ProcessOutcome::reply(UserAuthFailure::default().encode());
            }
        };
        let response = self.handler.on_auth_request(&request);
        tracing::info!(
            username = %request.username,
            method = %request.method_name,
            authenticated = response.authenticated,
            "user auth request"
        );
        if response.authenticated {
            ProcessOutcome::reply(encode_user_auth_success())
        } else {
            ProcessOutcome::reply(UserAuthFailure::default().encode())
        }
    }
}
