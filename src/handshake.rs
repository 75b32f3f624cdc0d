//! HTTP upgrade handshake, both directions.
//!
//! Both parsers work on the front of the ingress accumulator and report how
//! many bytes they consumed; anything after the blank-line terminator is
//! frame data and stays in the buffer.

use crate::Error;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1_smol::Sha1;
use std::collections::HashMap;

pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const SWITCHING_PROTOCOLS: &str = "HTTP/1.1 101 Switching Protocols";
const CRLF_CRLF: &[u8] = b"\r\n\r\n";
const MAX_KEY_LEN: usize = 24;

/// Derives the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let digest = Sha1::from(format!("{}{}", key, GUID)).digest().bytes();
    BASE64.encode(digest)
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn new_key() -> Result<String, Error> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce)?;
    Ok(BASE64.encode(nonce))
}

fn terminator_end(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF_CRLF.len())
        .position(|window| window == CRLF_CRLF)
        .map(|at| at + CRLF_CRLF.len())
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, &'a str>, Error> {
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let mut split = line.splitn(2, ':');
        let (Some(name), Some(value)) = (split.next(), split.next()) else {
            return Err(Error::InvalidHeaderLine(line.into()));
        };
        headers.insert(name.to_lowercase(), value.trim());
    }
    Ok(headers)
}

fn header_is(headers: &HashMap<String, &str>, name: &str, expect: &str) -> bool {
    headers
        .get(name)
        .map(|value| value.eq_ignore_ascii_case(expect))
        == Some(true)
}

/// An accepted upgrade request.
#[derive(Debug)]
pub struct Request {
    pub resource: String,
    pub key: String,
}

/// Parses a client upgrade request from the front of `buf`. Returns the
/// request and the number of bytes consumed, `Ok(None)` until the blank-line
/// terminator has arrived.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, Error> {
    let Some(end) = terminator_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..end]).map_err(|_| Error::HandshakeEncoding)?;

    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or("");
    let mut split = request_line.split_ascii_whitespace();
    let (Some("GET"), Some(resource), Some("HTTP/1.1")) =
        (split.next(), split.next(), split.next())
    else {
        return Err(Error::UnexpectedRequest(request_line.into()));
    };

    let headers = parse_headers(lines)?;

    if headers.get("host").is_none() {
        return Err(Error::MissingOrInvalidHeader("Host"));
    }
    if !header_is(&headers, "connection", "upgrade") {
        return Err(Error::MissingOrInvalidHeader("Connection"));
    }
    if !header_is(&headers, "upgrade", "websocket") {
        return Err(Error::MissingOrInvalidHeader("Upgrade"));
    }
    if !header_is(&headers, "sec-websocket-version", "13") {
        return Err(Error::MissingOrInvalidHeader("Sec-WebSocket-Version"));
    }

    let Some(key) = headers.get("sec-websocket-key") else {
        return Err(Error::MissingOrInvalidHeader("Sec-WebSocket-Key"));
    };
    if key.is_empty() || key.len() > MAX_KEY_LEN || !key.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::MissingOrInvalidHeader("Sec-WebSocket-Key"));
    }

    Ok(Some((
        Request {
            resource: resource.into(),
            key: (*key).into(),
        },
        end,
    )))
}

/// The `101 Switching Protocols` reply for an accepted request.
pub fn response_for(key: &str) -> String {
    format!(
        concat!(
            "{}\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            "Sec-WebSocket-Accept: {}\r\n",
            "\r\n",
        ),
        SWITCHING_PROTOCOLS,
        accept_key(key),
    )
}

/// The upgrade request a client opens with.
pub fn request_for(resource: &str, host: &str, port: u16, key: &str) -> String {
    format!(
        concat!(
            "GET {} HTTP/1.1\r\n",
            "Host: {}:{}\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade\r\n",
            "Sec-WebSocket-Key: {}\r\n",
            "Sec-WebSocket-Version: 13\r\n",
            "\r\n",
        ),
        resource, host, port, key,
    )
}

/// Checks the server's reply against the key we sent. Returns the number of
/// bytes consumed, `Ok(None)` until the terminator has arrived.
pub fn parse_response(buf: &[u8], sent_key: &str) -> Result<Option<usize>, Error> {
    let Some(end) = terminator_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..end]).map_err(|_| Error::HandshakeEncoding)?;

    let mut lines = text.lines();
    let status_line = lines.next().unwrap_or("");
    if status_line != SWITCHING_PROTOCOLS {
        return Err(Error::UnexpectedStatus(status_line.into()));
    }

    let headers = parse_headers(lines)?;

    if !header_is(&headers, "connection", "upgrade") {
        return Err(Error::MissingOrInvalidHeader("Connection"));
    }
    if !header_is(&headers, "upgrade", "websocket") {
        return Err(Error::MissingOrInvalidHeader("Upgrade"));
    }

    let expect = accept_key(sent_key);
    if headers.get("sec-websocket-accept").copied() != Some(expect.as_str()) {
        return Err(Error::MissingOrInvalidHeader("Sec-WebSocket-Accept"));
    }

    Ok(Some(end))
}
