//! # Minimal HTTP/1.0 Client
//!
//! One persistent, lazily-reconnecting connection to the configured server.
//! HTTP/1.0 with `Connection: keep-alive` on purpose: 1.1 cannot refuse
//! chunked transfer-encoding, and this client has nowhere to put an
//! unbounded body. Every response must therefore carry a usable
//! `Content-Length`.
//!
//! Two read modes, both bounded:
//! - [`HttpClient::get_quick`] accumulates the whole body into one buffer;
//! - [`HttpClient::get_stream`] hands back the live connection wrapped in a
//!   [`Body`], so the caller can pull bytes straight into the panel driver
//!   without a full in-memory copy.
//!
//! Failure policy: a failed send on a kept-alive socket gets exactly one
//! transparent reconnect-and-resend; everything after that propagates.

use chrono::NaiveDateTime;
use log::{debug, warn};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use thiserror::Error;

/// User agent sent with every request.
pub const USER_AGENT: &str = "TidePanel-IoTDisplay/1.0";

/// Errors from the HTTP client.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("couldn't connect to server: {0}")]
    Connect(#[source] io::Error),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    /// The status line was anything but `200 OK`; carries the raw line.
    #[error("can't handle server response: {0}")]
    BadStatusLine(String),

    /// `Content-Type` did not contain the expected substring.
    #[error("can't verify content type: wanted {wanted}, got {got}")]
    ContentType { wanted: String, got: String },

    /// Declared length exceeds what the caller is willing to hold.
    #[error("requested entity too large ({length} > {limit})")]
    TooLarge { length: u32, limit: u32 },

    /// Zero or missing `Content-Length`; chunked transfer is unsupported.
    #[error("not sure how big the payload is")]
    UnknownLength,

    /// Connection ended before the declared length arrived.
    #[error("body truncated at {got} of {want} bytes")]
    Truncated { got: usize, want: usize },
}

/// Dials a fresh stream to a host. The client re-dials through this when a
/// kept-alive socket turns out to be dead.
pub trait Dialer {
    type Stream: Read + Write;
    fn dial(&mut self, host: &str, port: u16) -> io::Result<Self::Stream>;
}

/// Production dialer over plain TCP.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    fn dial(&mut self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port))
    }
}

/// Parsed response head, built incrementally line-by-line until the blank
/// line terminator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResponseHead {
    pub status_line: String,
    pub content_length: u32,
    pub content_type: String,
    /// Decoded `Date` header, when present and well-formed.
    pub date: Option<NaiveDateTime>,
    /// Server signalled it will hold the connection open.
    pub keep_alive: bool,
}

impl ResponseHead {
    /// Fold one header line into the head.
    fn absorb(&mut self, line: &str) {
        let Some((name, value)) = line.split_once(':') else {
            return;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "date" => self.date = parse_http_date(value),
            "content-length" => {
                if let Ok(n) = value.parse() {
                    self.content_length = n;
                }
            }
            "content-type" => self.content_type = value.to_string(),
            "connection" | "keep-alive" => {
                if name.eq_ignore_ascii_case("keep-alive")
                    || value.to_ascii_lowercase().contains("keep-alive")
                {
                    self.keep_alive = true;
                }
            }
            _ => {}
        }
    }
}

/// Decode the fixed-format HTTP date, e.g. `Sun, 31 Jan 2016 14:16:24 GMT`.
fn parse_http_date(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT").ok()
}

/// Percent-encode one form field.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// The persistent client.
pub struct HttpClient<D: Dialer> {
    dialer: D,
    host: String,
    port: u16,
    stream: Option<D::Stream>,
    last_fetch_time: Option<NaiveDateTime>,
}

impl<D: Dialer> HttpClient<D> {
    pub fn new(host: impl Into<String>, port: u16, dialer: D) -> Self {
        Self {
            dialer,
            host: host.into(),
            port,
            stream: None,
            last_fetch_time: None,
        }
    }

    /// `Date` header of the most recent response; the device uses the
    /// server as its time source (GMT).
    pub fn last_fetch_time(&self) -> Option<NaiveDateTime> {
        self.last_fetch_time
    }

    /// Drop the connection, if any.
    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Header-driven GET returning the whole body in one buffer.
    pub fn get_quick(
        &mut self,
        path: &str,
        wanted_type: &str,
        max_length: u32,
    ) -> Result<Vec<u8>, HttpError> {
        let head = self.start_get(path, wanted_type, max_length)?;
        let want = head.content_length as usize;
        let mut content = vec![0u8; want];
        let mut got = 0;
        while got < want {
            let stream = self.stream_mut()?;
            match stream.read(&mut content[got..]) {
                Ok(0) => {
                    self.close();
                    return Err(HttpError::Truncated { got, want });
                }
                Ok(n) => got += n,
                Err(err) => {
                    self.close();
                    return Err(HttpError::Receive(err));
                }
            }
        }
        if !head.keep_alive {
            debug!("no keep-alive, closing socket");
            self.close();
        }
        Ok(content)
    }

    /// Header-driven GET returning the live connection plus the declared
    /// length, for streaming the body elsewhere. The caller must call
    /// [`Body::finish`] so the connection can be closed or kept alive.
    pub fn get_stream(
        &mut self,
        path: &str,
        wanted_type: &str,
        max_length: u32,
    ) -> Result<Body<'_, D>, HttpError> {
        let head = self.start_get(path, wanted_type, max_length)?;
        let declared = head.content_length as usize;
        let keep_alive = head.keep_alive;
        Ok(Body {
            client: self,
            declared,
            remaining: declared,
            keep_alive,
        })
    }

    /// Form-encoded POST. The response body is parsed for its head, then
    /// drained and discarded so the next exchange starts clean.
    pub fn post(&mut self, path: &str, fields: &[(&str, String)]) -> Result<ResponseHead, HttpError> {
        let body: String = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let request = format!(
            "POST {path} HTTP/1.0\r\n\
             Host: {host}\r\n\
             Connection: keep-alive\r\n\
             User-Agent: {USER_AGENT}\r\n\
             Accept-Encoding: identity\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {len}\r\n\
             \r\n\
             {body}",
            host = self.host,
            len = body.len(),
        );
        self.send_request(request.as_bytes())?;
        let head = self.read_head()?;

        // discard the body in small bounded reads
        let mut left = head.content_length as usize;
        let mut scratch = [0u8; 256];
        while left > 0 {
            let cap = left.min(scratch.len());
            let stream = self.stream_mut()?;
            match stream.read(&mut scratch[..cap]) {
                Ok(0) => break,
                Ok(n) => left -= n,
                Err(err) => {
                    self.close();
                    return Err(HttpError::Receive(err));
                }
            }
        }
        if !head.keep_alive {
            self.close();
        }
        Ok(head)
    }

    // -- private plumbing --

    fn start_get(
        &mut self,
        path: &str,
        wanted_type: &str,
        max_length: u32,
    ) -> Result<ResponseHead, HttpError> {
        let request = format!(
            "GET {path} HTTP/1.0\r\n\
             Host: {host}\r\n\
             Connection: keep-alive\r\n\
             User-Agent: {USER_AGENT}\r\n\
             Accept-Encoding: identity\r\n\
             \r\n",
            host = self.host,
        );
        self.send_request(request.as_bytes())?;
        let head = self.read_head()?;

        if head.content_length > max_length {
            // protect constrained memory before anything is read
            self.close();
            return Err(HttpError::TooLarge {
                length: head.content_length,
                limit: max_length,
            });
        }
        if !head.content_type.contains(wanted_type) {
            return Err(HttpError::ContentType {
                wanted: wanted_type.to_string(),
                got: head.content_type.clone(),
            });
        }
        if head.content_length == 0 {
            return Err(HttpError::UnknownLength);
        }
        Ok(head)
    }

    /// Write the request, transparently reopening a dead kept-alive socket
    /// and resending exactly once.
    fn send_request(&mut self, request: &[u8]) -> Result<(), HttpError> {
        if let Some(stream) = self.stream.as_mut() {
            if stream.write_all(request).and_then(|_| stream.flush()).is_ok() {
                return Ok(());
            }
            warn!("kept-alive socket went away, reconnecting");
            self.stream = None;
        }
        let mut stream = self
            .dialer
            .dial(&self.host, self.port)
            .map_err(HttpError::Connect)?;
        stream
            .write_all(request)
            .and_then(|_| stream.flush())
            .map_err(HttpError::Send)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn read_head(&mut self) -> Result<ResponseHead, HttpError> {
        let status_line = self.read_line()?;
        // first line had better be "HTTP/1.0 200 OK"
        if !status_line.contains("200 OK") {
            self.close();
            return Err(HttpError::BadStatusLine(status_line));
        }

        let mut head = ResponseHead {
            status_line,
            ..Default::default()
        };
        loop {
            let line = self.read_line()?;
            if line.is_empty() {
                break; // blank line, headers done
            }
            head.absorb(&line);
        }
        self.last_fetch_time = head.date;
        Ok(head)
    }

    /// Read one header line, byte at a time, stripping the terminator.
    fn read_line(&mut self) -> Result<String, HttpError> {
        let stream = self.stream_mut()?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(err) => return Err(HttpError::Receive(err)),
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn stream_mut(&mut self) -> Result<&mut D::Stream, HttpError> {
        self.stream.as_mut().ok_or_else(|| {
            HttpError::Receive(io::Error::new(
                io::ErrorKind::NotConnected,
                "no open connection",
            ))
        })
    }
}

/// A streamed response body: the live connection plus the declared length.
///
/// Reads never run past the declared length. Call [`Body::finish`] when
/// done so the connection can be closed (or kept, under keep-alive).
pub struct Body<'a, D: Dialer> {
    client: &'a mut HttpClient<D>,
    declared: usize,
    remaining: usize,
    keep_alive: bool,
}

impl<D: Dialer> Body<'_, D> {
    /// Length the server declared for this body.
    pub fn declared_len(&self) -> usize {
        self.declared
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Signal completion: closes the socket unless the server asked for
    /// keep-alive and the body was fully drained.
    pub fn finish(self) {
        if !self.keep_alive || self.remaining > 0 {
            self.client.close();
        }
    }
}

impl<D: Dialer> Read for Body<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let cap = buf.len().min(self.remaining);
        let stream = self
            .client
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no open connection"))?;
        let n = stream.read(&mut buf[..cap])?;
        self.remaining -= n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWire;

    const JSON_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\n\
        Date: Sun, 31 Jan 2016 14:16:24 GMT\r\n\
        Content-Type: application/json\r\n\
        Content-Length: 14\r\n\
        Connection: keep-alive\r\n\
        \r\n\
        {\"wakeup\": []}";

    fn client(wire: &MockWire) -> HttpClient<MockWire> {
        HttpClient::new("www.example.com", 80, wire.clone())
    }

    #[test]
    fn parses_head_and_returns_exact_body() {
        let wire = MockWire::new();
        wire.push_response(JSON_RESPONSE);
        let mut client = client(&wire);

        let body = client.get_quick("/metadata.json", "json", 1024).unwrap();
        assert_eq!(body, b"{\"wakeup\": []}");

        // the Date header became the fetch time
        let t = client.last_fetch_time().unwrap();
        assert_eq!(t.to_string(), "2016-01-31 14:16:24");

        let written = String::from_utf8(wire.written()).unwrap();
        assert!(written.starts_with("GET /metadata.json HTTP/1.0\r\n"));
        assert!(written.contains("Host: www.example.com\r\n"));
        assert!(written.contains("Connection: keep-alive\r\n"));
        assert!(written.contains("Accept-Encoding: identity\r\n"));
        assert!(written.contains(&format!("User-Agent: {USER_AGENT}\r\n")));
    }

    #[test]
    fn header_parser_handles_the_documented_example() {
        let mut head = ResponseHead::default();
        head.absorb("Content-Length: 1234");
        head.absorb("Content-Type: application/json");
        head.absorb("Date: Sun, 31 Jan 2016 14:16:24 GMT");
        head.absorb("Connection: keep-alive");

        assert_eq!(head.content_length, 1234);
        assert!(head.content_type.contains("json"));
        assert!(head.keep_alive);
        let t = head.date.unwrap();
        assert_eq!(t.to_string(), "2016-01-31 14:16:24");
    }

    #[test]
    fn keep_alive_socket_is_reused_across_requests() {
        let wire = MockWire::new();
        wire.push_response(JSON_RESPONSE);
        wire.push_response(JSON_RESPONSE);
        let mut client = client(&wire);

        client.get_quick("/a", "json", 1024).unwrap();
        client.get_quick("/b", "json", 1024).unwrap();
        assert_eq!(wire.dials(), 1);
    }

    #[test]
    fn dead_socket_gets_one_reconnect_and_resend() {
        let wire = MockWire::new();
        wire.push_response(JSON_RESPONSE);
        wire.push_response(JSON_RESPONSE);
        let mut client = client(&wire);

        client.get_quick("/a", "json", 1024).unwrap();
        wire.fail_next_write();
        client.get_quick("/b", "json", 1024).unwrap();
        assert_eq!(wire.dials(), 2);

        // the resent request made it out whole
        let written = String::from_utf8(wire.written()).unwrap();
        assert!(written.contains("GET /b HTTP/1.0"));
    }

    #[test]
    fn non_200_status_line_is_fatal_and_carries_the_line() {
        let wire = MockWire::new();
        wire.push_response(b"HTTP/1.0 404 Not Found\r\n\r\n");
        let err = client(&wire).get_quick("/a", "json", 1024).unwrap_err();
        match err {
            HttpError::BadStatusLine(line) => assert!(line.contains("404")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversize_and_zero_length_bodies_are_rejected() {
        let wire = MockWire::new();
        wire.push_response(JSON_RESPONSE);
        let err = client(&wire).get_quick("/a", "json", 10).unwrap_err();
        assert!(matches!(err, HttpError::TooLarge { length: 14, limit: 10 }));

        let wire = MockWire::new();
        wire.push_response(b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n");
        let err = client(&wire).get_quick("/a", "json", 1024).unwrap_err();
        assert!(matches!(err, HttpError::UnknownLength));
    }

    #[test]
    fn content_type_mismatch_is_an_error_not_a_warning() {
        let wire = MockWire::new();
        wire.push_response(JSON_RESPONSE);
        let err = client(&wire)
            .get_quick("/a", "octet-stream", 1024)
            .unwrap_err();
        assert!(matches!(err, HttpError::ContentType { .. }));
    }

    #[test]
    fn truncated_body_is_reported() {
        let wire = MockWire::new();
        wire.push_response(
            b"HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: 50\r\n\r\nshort",
        );
        let err = client(&wire).get_quick("/a", "json", 1024).unwrap_err();
        assert!(matches!(err, HttpError::Truncated { got: 5, want: 50 }));
    }

    #[test]
    fn streamed_body_reports_length_and_reads_incrementally() {
        let wire = MockWire::new();
        let mut response = b"HTTP/1.0 200 OK\r\n\
            Content-Type: application/octet-stream\r\n\
            Content-Length: 600\r\n\
            Connection: keep-alive\r\n\
            \r\n"
            .to_vec();
        response.extend(std::iter::repeat(0xabu8).take(600));
        wire.push_response(&response);

        let mut client = client(&wire);
        let mut body = client.get_stream("/image.bin", "octet-stream", 1024).unwrap();
        assert_eq!(body.declared_len(), 600);

        let mut chunk = [0u8; 250];
        let mut total = 0;
        loop {
            let n = body.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 600);
        assert_eq!(body.remaining(), 0);
        body.finish();

        // fully drained keep-alive body leaves the connection usable
        wire.push_response(JSON_RESPONSE);
        client.get_quick("/next", "json", 1024).unwrap();
        assert_eq!(wire.dials(), 1);
    }

    #[test]
    fn post_sends_form_encoding_and_drains_response() {
        let wire = MockWire::new();
        wire.push_response(
            b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nok",
        );
        let mut client = client(&wire);

        client
            .post(
                "/upload.php",
                &[
                    ("battery", "87".to_string()),
                    ("reset", "sleep".to_string()),
                    ("screen", "21 c".to_string()),
                ],
            )
            .unwrap();

        let written = String::from_utf8(wire.written()).unwrap();
        assert!(written.starts_with("POST /upload.php HTTP/1.0\r\n"));
        assert!(written.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(written.contains("Content-Length: 34\r\n"));
        assert!(written.ends_with("battery=87&reset=sleep&screen=21+c"));
    }
}
