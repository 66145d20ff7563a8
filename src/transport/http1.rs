//! HTTP/1.1 framing for exchanges carried over a channel.
//!
//! Requests are written by hand because the device's parser depends on
//! header order: `Authorization` must come first. Responses are read back
//! from whatever the channel accumulated, so completeness is judged from the
//! bytes themselves rather than from a connection close.

use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode, Version};

use super::TransportError;

pub const DEFAULT_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

const HEADER_END: &[u8] = b"\r\n\r\n";
const CHUNKED_TERMINATOR: &[u8] = b"\r\n0\r\n\r\n";
const CLOSING_TAGS: [&[u8]; 5] = [
    b"</a:Envelope>",
    b"</s:Envelope>",
    b"</SOAP-ENV:Envelope>",
    b"</html>",
    b"</HTML>",
];

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Serializes `request` in the fixed header order the device expects.
pub fn encode_request(request: &Request<Vec<u8>>) -> Result<Vec<u8>, TransportError> {
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let headers = request.headers();
    let host = match headers.get(HOST) {
        Some(value) => header_str(value)?.to_string(),
        None => request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| TransportError::InvalidRequest("request has no host".into()))?,
    };
    let content_type = match headers.get(CONTENT_TYPE) {
        Some(value) => header_str(value)?,
        None => DEFAULT_CONTENT_TYPE,
    };
    let body = request.body();

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method(), path).as_bytes());
    if let Some(auth) = headers.get(AUTHORIZATION) {
        out.extend_from_slice(b"Authorization: ");
        out.extend_from_slice(auth.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

fn header_str(value: &HeaderValue) -> Result<&str, TransportError> {
    value
        .to_str()
        .map_err(|e| TransportError::InvalidRequest(format!("non-ascii header value: {e}")))
}

/// Whether the accumulated bytes hold a whole response.
pub fn response_complete(buf: &[u8]) -> bool {
    if CLOSING_TAGS.iter().any(|tag| find(buf, tag).is_some()) {
        return true;
    }
    if buf.ends_with(CHUNKED_TERMINATOR) {
        return true;
    }
    let Some(head_end) = find(buf, HEADER_END) else {
        return false;
    };
    let head = &buf[..head_end];
    match content_length(head) {
        Some(len) => buf.len() - (head_end + HEADER_END.len()) >= len,
        None => false,
    }
}

fn content_length(head: &[u8]) -> Option<usize> {
    head.split(|&b| b == b'\n').find_map(|line| {
        let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-length") {
            return None;
        }
        value.trim().parse().ok()
    })
}

/// Parses a complete HTTP/1.1 response, removing chunked transfer coding.
pub fn parse_response(buf: &[u8]) -> Result<Response<Vec<u8>>, TransportError> {
    let head_end = find(buf, HEADER_END)
        .ok_or_else(|| TransportError::InvalidResponse("missing end of headers".into()))?;
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| TransportError::InvalidResponse("headers are not utf-8".into()))?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let (version, status) = parse_status_line(status_line)?;

    let mut builder = Response::builder().status(status).version(version);
    let mut chunked = false;
    let mut declared_len = None;
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::InvalidResponse(format!("malformed header line {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let value = value.trim();
        if name == TRANSFER_ENCODING && value.eq_ignore_ascii_case("chunked") {
            chunked = true;
            continue;
        }
        if name == CONTENT_LENGTH {
            declared_len = value.parse::<usize>().ok();
        }
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        builder = builder.header(name, value);
    }

    let raw_body = &buf[head_end + HEADER_END.len()..];
    let body = if chunked {
        dechunk(raw_body)?
    } else if let Some(len) = declared_len {
        raw_body[..len.min(raw_body.len())].to_vec()
    } else {
        raw_body.to_vec()
    };
    builder
        .body(body)
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

fn parse_status_line(line: &str) -> Result<(Version, StatusCode), TransportError> {
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        other => {
            return Err(TransportError::InvalidResponse(format!(
                "unsupported protocol {other:?}"
            )))
        }
    };
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| TransportError::InvalidResponse(format!("bad status line {line:?}")))?;
    Ok((version, status))
}

fn dechunk(mut raw: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut body = Vec::with_capacity(raw.len());
    loop {
        let line_end = find(raw, b"\r\n")
            .ok_or_else(|| TransportError::InvalidResponse("truncated chunk size".into()))?;
        let size_line = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| TransportError::InvalidResponse("chunk size is not utf-8".into()))?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| TransportError::InvalidResponse(format!("bad chunk size {size_hex:?}")))?;
        raw = &raw[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if raw.len() < size + 2 {
            return Err(TransportError::InvalidResponse("truncated chunk".into()));
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}
