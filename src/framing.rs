//! Stream framing for APF.
//!
//! APF has no outer length header: the length of each message follows from
//! its type tag and, for variable layouts, the length prefixes inside it.
//! [`frame_len`] walks just enough of the buffered bytes to know where the
//! next message ends, so the stream can be split before any message is
//! decoded.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{
    DecodeError, MessageType, AUTH_METHOD_PASSWORD, GLOBAL_REQUEST_CANCEL_TCP_FORWARD,
    GLOBAL_REQUEST_TCP_FORWARD, MAX_FIELD_LEN, PROTOCOL_VERSION_RESERVED_LEN,
};

/// Default bound on a single inbound frame.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Big-endian `u32` at `offset`, or `None` if not yet buffered.
fn u32_at(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Cursor over a partially buffered message. `None` from any step means the
/// message is not complete yet.
struct LengthWalker<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> LengthWalker<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 1 }
    }

    fn skip(&mut self, n: usize) {
        self.offset += n;
    }

    /// Skips a 4-byte length prefixed field. `None` until the prefix itself
    /// is buffered.
    fn skip_string(&mut self, field: &'static str) -> Result<Option<()>, DecodeError> {
        let Some(len) = u32_at(self.buf, self.offset) else {
            return Ok(None);
        };
        let len = len as usize;
        if len > MAX_FIELD_LEN {
            return Err(DecodeError::InvalidLength { field, len });
        }
        self.offset += 4 + len;
        Ok(Some(()))
    }

    /// Like [`Self::skip_string`] but also needs the contents buffered.
    fn string(&mut self, field: &'static str) -> Result<Option<&'a [u8]>, DecodeError> {
        let start = self.offset + 4;
        if self.skip_string(field)?.is_none() {
            return Ok(None);
        }
        Ok(self.buf.get(start..self.offset))
    }

    /// Skips a 1-byte length prefixed field.
    fn short_string(&mut self) -> Option<()> {
        let len = *self.buf.get(self.offset)? as usize;
        self.offset += 1 + len;
        Some(())
    }

    fn byte(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.offset)?;
        self.offset += 1;
        Some(byte)
    }

    fn finish(&self) -> Option<usize> {
        Some(self.offset)
    }
}

/// Length of the message at the front of `buf`, `Ok(None)` if more bytes are
/// needed to tell.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    let kind = MessageType::from_byte(tag).ok_or(DecodeError::UnknownMessageType(tag))?;
    let mut w = LengthWalker::new(buf);
    let len = match kind {
        MessageType::Disconnect => Some(7),
        MessageType::UserAuthSuccess | MessageType::RequestSuccess | MessageType::RequestFailure => {
            Some(1)
        }
        MessageType::ServiceRequest | MessageType::ServiceAccept => {
            w.skip_string("service name")?.and_then(|()| w.finish())
        }
        MessageType::UserAuthRequest => user_auth_len(&mut w)?,
        MessageType::UserAuthFailure => w.skip_string("authentications")?.and_then(|()| {
            w.skip(1);
            w.finish()
        }),
        MessageType::GlobalRequest => global_request_len(&mut w)?,
        MessageType::ChannelOpen => channel_open_len(&mut w),
        MessageType::ChannelOpenConfirmation | MessageType::ChannelOpenFailure => Some(17),
        MessageType::ChannelWindowAdjust => Some(9),
        MessageType::ChannelData => u32_at(buf, 5).map(|len| 9 + len as usize),
        MessageType::ChannelClose => Some(5),
        MessageType::ProtocolVersion => Some(29 + PROTOCOL_VERSION_RESERVED_LEN),
        MessageType::KeepAliveRequest | MessageType::KeepAliveReply => Some(5),
        MessageType::KeepAliveOptionsRequest | MessageType::KeepAliveOptionsReply => Some(9),
    };
    Ok(len)
}

fn user_auth_len(w: &mut LengthWalker<'_>) -> Result<Option<usize>, DecodeError> {
    if w.skip_string("username")?.is_none() || w.skip_string("service name")?.is_none() {
        return Ok(None);
    }
    let Some(method) = w.string("method name")? else {
        return Ok(None);
    };
    if method == AUTH_METHOD_PASSWORD.as_bytes() {
        if w.byte().is_none() {
            return Ok(None);
        }
        if w.skip_string("password")?.is_none() {
            return Ok(None);
        }
    }
    Ok(w.finish())
}

fn global_request_len(w: &mut LengthWalker<'_>) -> Result<Option<usize>, DecodeError> {
    let Some(request) = w.string("request string")? else {
        return Ok(None);
    };
    if request.is_empty() {
        return Ok(w.finish());
    }
    w.skip(1);
    if request == GLOBAL_REQUEST_TCP_FORWARD.as_bytes()
        || request == GLOBAL_REQUEST_CANCEL_TCP_FORWARD.as_bytes()
    {
        if w.skip_string("address")?.is_none() {
            return Ok(None);
        }
        w.skip(4);
    }
    Ok(w.finish())
}

fn channel_open_len(w: &mut LengthWalker<'_>) -> Option<usize> {
    w.short_string()?;
    w.skip(12);
    w.short_string()?;
    w.skip(4);
    w.short_string()?;
    w.skip(4);
    w.finish()
}

/// Splits an inbound byte stream into whole APF messages.
#[derive(Debug, Clone)]
pub struct ApfCodec {
    max_frame: usize,
}

impl ApfCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for ApfCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for ApfCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        let Some(len) = frame_len(src)? else {
            return Ok(None);
        };
        if len > self.max_frame {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame,
            }
            .into());
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for ApfCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(item.as_ref());
        Ok(())
    }
}

/// Framing failures. Any of these leaves the stream unusable.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
