//! APF wire messages.
//!
//! Every message starts with a one-byte type tag followed by fixed-width
//! big-endian integers, fixed-size protocol strings, and 4-byte length
//! prefixed strings for anything a peer supplies. Decoders never read past the
//! end of the input and cap every variable-length field at
//! [`MAX_FIELD_LEN`] bytes.

use bytes::{BufMut, Bytes};
use thiserror::Error;

/// Upper bound for every length-prefixed user-supplied field.
pub const MAX_FIELD_LEN: usize = 2048;

/// Port-forwarding service name.
pub const SERVICE_PFWD: &str = "pfwd@amt.intel.com";
/// Authentication service name.
pub const SERVICE_AUTH: &str = "auth@amt.intel.com";
/// Both known service names share this exact length.
pub const SERVICE_NAME_LEN: usize = 18;

/// Channel type used for every channel this engine opens.
pub const CHANNEL_TYPE_FORWARDED_TCPIP: &str = "forwarded-tcpip";

pub const GLOBAL_REQUEST_TCP_FORWARD: &str = "tcpip-forward";
pub const GLOBAL_REQUEST_CANCEL_TCP_FORWARD: &str = "cancel-tcpip-forward";

/// The only authentication method that carries a password block.
pub const AUTH_METHOD_PASSWORD: &str = "password";

/// Reserved field value sent in channel-open messages.
pub const CHANNEL_OPEN_RESERVED: u32 = 0xFFFF_FFFF;

/// Trailing reserved bytes after the fixed protocol-version fields.
pub const PROTOCOL_VERSION_RESERVED_LEN: usize = 64;

/// APF message type tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Disconnect = 1,
    ServiceRequest = 5,
    ServiceAccept = 6,
    UserAuthRequest = 50,
    UserAuthFailure = 51,
    UserAuthSuccess = 52,
    GlobalRequest = 80,
    RequestSuccess = 81,
    RequestFailure = 82,
    ChannelOpen = 90,
    ChannelOpenConfirmation = 91,
    ChannelOpenFailure = 92,
    ChannelWindowAdjust = 93,
    ChannelData = 94,
    ChannelClose = 97,
    ProtocolVersion = 192,
    KeepAliveRequest = 208,
    KeepAliveReply = 209,
    KeepAliveOptionsRequest = 210,
    KeepAliveOptionsReply = 211,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let kind = match byte {
            1 => Self::Disconnect,
            5 => Self::ServiceRequest,
            6 => Self::ServiceAccept,
            50 => Self::UserAuthRequest,
            51 => Self::UserAuthFailure,
            52 => Self::UserAuthSuccess,
            80 => Self::GlobalRequest,
            81 => Self::RequestSuccess,
            82 => Self::RequestFailure,
            90 => Self::ChannelOpen,
            91 => Self::ChannelOpenConfirmation,
            92 => Self::ChannelOpenFailure,
            93 => Self::ChannelWindowAdjust,
            94 => Self::ChannelData,
            97 => Self::ChannelClose,
            192 => Self::ProtocolVersion,
            208 => Self::KeepAliveRequest,
            209 => Self::KeepAliveReply,
            210 => Self::KeepAliveOptionsRequest,
            211 => Self::KeepAliveOptionsReply,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Frames addressed to a single channel rather than the connection.
    pub fn is_channel_scoped(self) -> bool {
        matches!(
            self,
            Self::ChannelOpenConfirmation
                | Self::ChannelOpenFailure
                | Self::ChannelWindowAdjust
                | Self::ChannelData
                | Self::ChannelClose
        )
    }
}

/// Errors produced while decoding untrusted frames.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("invalid length {len} for {field}")]
    InvalidLength { field: &'static str, len: usize },
    #[error("expected message type {expected}, found {found}")]
    UnexpectedType { expected: u8, found: u8 },
    #[error("password confirm byte must be zero, found {0}")]
    InvalidConfirmByte(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// Returns the type tag of a framed message.
pub fn peek_type(frame: &[u8]) -> Result<MessageType, DecodeError> {
    let byte = *frame.first().ok_or(DecodeError::Empty)?;
    MessageType::from_byte(byte).ok_or(DecodeError::UnknownMessageType(byte))
}

/// Bounds-checked cursor over an inbound frame.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.buf.len() {
            return Err(DecodeError::Truncated {
                field,
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(field, 1)?[0])
    }

    pub(crate) fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(field, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    /// Reads a declared length and checks it against `max` and the bytes left.
    pub(crate) fn checked_len(
        &mut self,
        field: &'static str,
        len: usize,
        max: usize,
    ) -> Result<usize, DecodeError> {
        if len > max || len > self.remaining() {
            return Err(DecodeError::InvalidLength { field, len });
        }
        Ok(len)
    }

    /// 4-byte length prefixed field capped at [`MAX_FIELD_LEN`].
    pub(crate) fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let declared = self.u32(field)? as usize;
        let len = self.checked_len(field, declared, MAX_FIELD_LEN)?;
        Ok(String::from_utf8_lossy(self.take(field, len)?).into_owned())
    }

    /// 1-byte length prefixed field.
    fn short_string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let declared = self.u8(field)? as usize;
        let len = self.checked_len(field, declared, u8::MAX as usize)?;
        Ok(String::from_utf8_lossy(self.take(field, len)?).into_owned())
    }

    pub(crate) fn expect_type(&mut self, expected: MessageType) -> Result<(), DecodeError> {
        let found = self.u8("message type")?;
        if found != expected.as_byte() {
            return Err(DecodeError::UnexpectedType {
                expected: expected.as_byte(),
                found,
            });
        }
        Ok(())
    }
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_short_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveRequest {
    pub cookie: u32,
}

impl KeepAliveRequest {
    pub fn encode(&self) -> Vec<u8> {
        encode_cookie(MessageType::KeepAliveRequest, self.cookie)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        decode_cookie(MessageType::KeepAliveRequest, buf).map(|cookie| Self { cookie })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveReply {
    pub cookie: u32,
}

impl KeepAliveReply {
    pub fn encode(&self) -> Vec<u8> {
        encode_cookie(MessageType::KeepAliveReply, self.cookie)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        decode_cookie(MessageType::KeepAliveReply, buf).map(|cookie| Self { cookie })
    }
}

fn encode_cookie(kind: MessageType, cookie: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.put_u8(kind.as_byte());
    buf.put_u32(cookie);
    buf
}

fn decode_cookie(kind: MessageType, buf: &[u8]) -> Result<u32, DecodeError> {
    let mut r = WireReader::new(buf);
    r.expect_type(kind)?;
    r.u32("cookie")
}

/// Keep-alive interval negotiation; requests and replies share this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveOptions {
    pub interval_secs: u32,
    pub timeout_secs: u32,
}

impl KeepAliveOptions {
    pub fn encode_request(&self) -> Vec<u8> {
        self.encode_as(MessageType::KeepAliveOptionsRequest)
    }

    pub fn encode_reply(&self) -> Vec<u8> {
        self.encode_as(MessageType::KeepAliveOptionsReply)
    }

    fn encode_as(&self, kind: MessageType) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.put_u8(kind.as_byte());
        buf.put_u32(self.interval_secs);
        buf.put_u32(self.timeout_secs);
        buf
    }

    pub fn decode(kind: MessageType, buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(kind)?;
        Ok(Self {
            interval_secs: r.u32("keep-alive interval")?,
            timeout_secs: r.u32("keep-alive timeout")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub service_name: String,
}

impl ServiceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.service_name.len());
        buf.put_u8(MessageType::ServiceRequest.as_byte());
        put_string(&mut buf, &self.service_name);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ServiceRequest)?;
        Ok(Self {
            service_name: r.string("service name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    pub service_name: String,
}

impl ServiceAccept {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.service_name.len());
        buf.put_u8(MessageType::ServiceAccept.as_byte());
        put_string(&mut buf, &self.service_name);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ServiceAccept)?;
        Ok(Self {
            service_name: r.string("service name")?,
        })
    }
}

/// Protocol version announcement. The UUID is kept in wire byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major_version: u32,
    pub minor_version: u32,
    pub trigger_reason: u32,
    pub uuid: [u8; 16],
}

impl ProtocolVersion {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(29 + PROTOCOL_VERSION_RESERVED_LEN);
        buf.put_u8(MessageType::ProtocolVersion.as_byte());
        buf.put_u32(self.major_version);
        buf.put_u32(self.minor_version);
        buf.put_u32(self.trigger_reason);
        buf.put_slice(&self.uuid);
        buf.put_bytes(0, PROTOCOL_VERSION_RESERVED_LEN);
        buf
    }

    /// Reserved trailing bytes are optional on input.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ProtocolVersion)?;
        Ok(Self {
            major_version: r.u32("major version")?,
            minor_version: r.u32("minor version")?,
            trigger_reason: r.u32("trigger reason")?,
            uuid: r.array::<16>("uuid")?,
        })
    }
}

/// Decoded user authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub username: String,
    pub service_name: String,
    pub method_name: String,
    /// Present only when `method_name` is `"password"`.
    pub password: Option<String>,
}

impl AuthRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(MessageType::UserAuthRequest.as_byte());
        put_string(&mut buf, &self.username);
        put_string(&mut buf, &self.service_name);
        put_string(&mut buf, &self.method_name);
        if self.method_name == AUTH_METHOD_PASSWORD {
            buf.put_u8(0);
            put_string(&mut buf, self.password.as_deref().unwrap_or_default());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::UserAuthRequest)?;
        let username = r.string("username")?;
        let service_name = r.string("service name")?;
        let method_name = r.string("method name")?;
        let password = if method_name == AUTH_METHOD_PASSWORD {
            let confirm = r.u8("password confirm byte")?;
            if confirm != 0 {
                return Err(DecodeError::InvalidConfirmByte(confirm));
            }
            Some(r.string("password")?)
        } else {
            None
        };
        Ok(Self {
            username,
            service_name,
            method_name,
            password,
        })
    }
}

/// Single-byte user-auth success.
pub fn encode_user_auth_success() -> Vec<u8> {
    vec![MessageType::UserAuthSuccess.as_byte()]
}

/// User-auth failure advertising the methods that may continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAuthFailure {
    pub authentications: String,
    pub partial_success: bool,
}

impl Default for UserAuthFailure {
    fn default() -> Self {
        Self {
            authentications: AUTH_METHOD_PASSWORD.to_string(),
            partial_success: false,
        }
    }
}

impl UserAuthFailure {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14);
        buf.put_u8(MessageType::UserAuthFailure.as_byte());
        put_string(&mut buf, &self.authentications);
        buf.put_u8(u8::from(self.partial_success));
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::UserAuthFailure)?;
        Ok(Self {
            authentications: r.string("authentications")?,
            partial_success: r.u8("partial success")? != 0,
        })
    }
}

/// Decoded global request. Address and port are only carried by the two
/// forwarding requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalRequest {
    pub request: String,
    pub want_reply: bool,
    pub address: String,
    pub port: u32,
}

impl GlobalRequest {
    pub fn is_forwarding(&self) -> bool {
        self.request == GLOBAL_REQUEST_TCP_FORWARD
            || self.request == GLOBAL_REQUEST_CANCEL_TCP_FORWARD
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(MessageType::GlobalRequest.as_byte());
        put_string(&mut buf, &self.request);
        buf.put_u8(u8::from(self.want_reply));
        if self.is_forwarding() {
            put_string(&mut buf, &self.address);
            buf.put_u32(self.port);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::GlobalRequest)?;
        let mut request = Self {
            request: r.string("request string")?,
            ..Self::default()
        };
        if request.request.is_empty() {
            return Ok(request);
        }
        request.want_reply = r.u8("want reply")? != 0;
        if request.is_forwarding() {
            request.address = r.string("address")?;
            request.port = r.u32("port")?;
        }
        Ok(request)
    }
}

/// Generic single-byte request success.
pub fn encode_request_success() -> Vec<u8> {
    vec![MessageType::RequestSuccess.as_byte()]
}

pub fn encode_request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure.as_byte()]
}

/// Request success carrying the bound port of a `tcpip-forward`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpForwardReply {
    pub port_bound: u32,
}

impl TcpForwardReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.put_u8(MessageType::RequestSuccess.as_byte());
        buf.put_u32(self.port_bound);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::RequestSuccess)?;
        Ok(Self {
            port_bound: r.u32("port bound")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    pub channel_type: String,
    pub sender_channel: u32,
    pub initial_window: u32,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl ChannelOpen {
    /// Builds a `forwarded-tcpip` open request.
    pub fn forwarded_tcpip(
        sender_channel: u32,
        initial_window: u32,
        connected: (&str, u32),
        originator: (&str, u32),
    ) -> Self {
        Self {
            channel_type: CHANNEL_TYPE_FORWARDED_TCPIP.to_string(),
            sender_channel,
            initial_window,
            connected_address: connected.0.to_string(),
            connected_port: connected.1,
            originator_address: originator.0.to_string(),
            originator_port: originator.1,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            39 + self.channel_type.len()
                + self.connected_address.len()
                + self.originator_address.len(),
        );
        buf.put_u8(MessageType::ChannelOpen.as_byte());
        put_short_string(&mut buf, &self.channel_type);
        buf.put_u32(self.sender_channel);
        buf.put_u32(CHANNEL_OPEN_RESERVED);
        buf.put_u32(self.initial_window);
        put_short_string(&mut buf, &self.connected_address);
        buf.put_u32(self.connected_port);
        put_short_string(&mut buf, &self.originator_address);
        buf.put_u32(self.originator_port);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ChannelOpen)?;
        let channel_type = r.short_string("channel type")?;
        let sender_channel = r.u32("sender channel")?;
        r.u32("reserved")?;
        Ok(Self {
            channel_type,
            sender_channel,
            initial_window: r.u32("initial window")?,
            connected_address: r.short_string("connected address")?,
            connected_port: r.u32("connected port")?,
            originator_address: r.short_string("originator address")?,
            originator_port: r.u32("originator port")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    pub recipient_channel: u32,
    pub sender_channel: u32,
    pub initial_window: u32,
}

impl ChannelOpenConfirmation {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation.as_byte());
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window);
        buf.put_u32(CHANNEL_OPEN_RESERVED);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ChannelOpenConfirmation)?;
        let confirmation = Self {
            recipient_channel: r.u32("recipient channel")?,
            sender_channel: r.u32("sender channel")?,
            initial_window: r.u32("initial window")?,
        };
        r.u32("reserved")?;
        Ok(confirmation)
    }
}

/// Reason a peer refused to open a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailureReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Other(u32),
}

impl OpenFailureReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::AdministrativelyProhibited,
            2 => Self::ConnectFailed,
            3 => Self::UnknownChannelType,
            4 => Self::ResourceShortage,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::AdministrativelyProhibited => 1,
            Self::ConnectFailed => 2,
            Self::UnknownChannelType => 3,
            Self::ResourceShortage => 4,
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdministrativelyProhibited => f.write_str("administratively prohibited"),
            Self::ConnectFailed => f.write_str("connect failed"),
            Self::UnknownChannelType => f.write_str("unknown channel type"),
            Self::ResourceShortage => f.write_str("resource shortage"),
            Self::Other(code) => write!(f, "reason code {code}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    pub recipient_channel: u32,
    pub reason: OpenFailureReason,
}

impl ChannelOpenFailure {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenFailure.as_byte());
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason.code());
        buf.put_u32(0);
        buf.put_u32(0);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ChannelOpenFailure)?;
        let failure = Self {
            recipient_channel: r.u32("recipient channel")?,
            reason: OpenFailureReason::from_code(r.u32("reason code")?),
        };
        r.u32("reserved")?;
        r.u32("reserved")?;
        Ok(failure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    pub recipient_channel: u32,
}

impl ChannelClose {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5);
        buf.put_u8(MessageType::ChannelClose.as_byte());
        buf.put_u32(self.recipient_channel);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ChannelClose)?;
        Ok(Self {
            recipient_channel: r.u32("recipient channel")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub recipient_channel: u32,
    pub data: Bytes,
}

impl ChannelData {
    pub fn encode(&self) -> Vec<u8> {
        Self::encode_slice(self.recipient_channel, &self.data)
    }

    /// Encodes a data frame without building an owned message first.
    pub fn encode_slice(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + data.len());
        buf.put_u8(MessageType::ChannelData.as_byte());
        buf.put_u32(recipient_channel);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ChannelData)?;
        let recipient_channel = r.u32("recipient channel")?;
        let declared = r.u32("data length")? as usize;
        let len = r.checked_len("data", declared, usize::MAX)?;
        Ok(Self {
            recipient_channel,
            data: Bytes::copy_from_slice(r.take("data", len)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    pub recipient_channel: u32,
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust.as_byte());
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.u32("recipient channel")?,
            bytes_to_add: r.u32("bytes to add")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub reason_code: u32,
}

impl Disconnect {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7);
        buf.put_u8(MessageType::Disconnect.as_byte());
        buf.put_u32(self.reason_code);
        buf.put_u16(0);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = WireReader::new(buf);
        r.expect_type(MessageType::Disconnect)?;
        Ok(Self {
            reason_code: r.u32("reason code")?,
        })
    }
}
