use thiserror::Error;

use crate::messages::{AuthRequest, GlobalRequest};

/// Protocol version announced by the peer, with the system UUID rendered as
/// GUID text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolVersionInfo {
    pub major_version: u32,
    pub minor_version: u32,
    pub trigger_reason: u32,
    pub system_uuid: String,
}

/// Verdict returned for a user authentication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthResponse {
    pub authenticated: bool,
}

/// Policy rejection raised by a [`Handler`].
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Application policy consulted by the processor.
///
/// All methods are synchronous and run on the demux task, so implementations
/// should only record state and decide. The defaults accept any protocol
/// version, deny authentication, and ask for no keep-alive options.
pub trait Handler: Send + Sync {
    /// Returning an error drops the peer's announcement without a reply.
    fn on_protocol_version(&self, _info: &ProtocolVersionInfo) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_auth_request(&self, _request: &AuthRequest) -> AuthResponse {
        AuthResponse::default()
    }

    /// Returns `true` when the caller should follow up with a keep-alive
    /// options request.
    fn on_global_request(&self, _request: &GlobalRequest) -> bool {
        false
    }
}

/// Handler that keeps every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl Handler for NoopHandler {}

impl<H: Handler + ?Sized> Handler for std::sync::Arc<H> {
    fn on_protocol_version(&self, info: &ProtocolVersionInfo) -> Result<(), HandlerError> {
        (**self).on_protocol_version(info)
    }

    fn on_auth_request(&self, request: &AuthRequest) -> AuthResponse {
        (**self).on_auth_request(request)
    }

    fn on_global_request(&self, request: &GlobalRequest) -> bool {
        (**self).on_global_request(request)
    }
}
