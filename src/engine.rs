//! HTTP/1.1 client engine over a byte transport.
//!
//! [`EngineConnection`] adapts any [`ByteTransport`](crate::transport::ByteTransport)
//! into the pool's [`Connection`] seam: it encodes outgoing requests
//! (Content-Length framing for strict bodies, chunked for streamed ones) and
//! incrementally decodes responses (Content-Length, chunked with trailers,
//! EOF-delimited, and bodyless statuses), reporting everything as
//! [`WireEvent`]s.
//!
//! # Limits
//!
//! - Maximum response header block: 64 KiB
//! - Maximum number of headers: 128

use crate::body::{BodyPoll, RequestBody};
use crate::conn::{Connection, WireEvent};
use crate::http::{Method, Request, ResponseHead, Version};
use crate::transport::{ByteTransport, ReadOutcome};
use crate::types::Time;
use std::fmt::Write as _;

/// Maximum allowed response header block size (64 KiB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of response headers.
const MAX_HEADERS: usize = 128;

#[derive(Debug)]
enum DecodeState {
    /// No response outstanding.
    Quiet,
    /// Waiting for the status line and header block.
    Head,
    /// Streaming a Content-Length body.
    FixedBody { remaining: u64 },
    /// Streaming a chunked body.
    Chunked(ChunkState),
    /// Streaming an EOF-delimited body.
    EofBody,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    SizeLine,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

#[derive(Debug)]
enum Upload {
    /// Nothing to send (strict bodies go out with the head).
    Done,
    /// Pulling a streamed body, chunk-encoding as it arrives.
    Streaming { body: RequestBody, started: bool },
}

/// HTTP/1.1 client connection over a non-blocking byte transport.
#[derive(Debug)]
pub struct EngineConnection<T> {
    transport: T,
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
    decode: DecodeState,
    upload: Upload,
    request_method: Option<Method>,
    eof_seen: bool,
    terminated: bool,
}

impl<T: ByteTransport> EngineConnection<T> {
    /// Wraps a transport in a fresh client connection.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            write_buf: Vec::new(),
            read_buf: Vec::new(),
            decode: DecodeState::Quiet,
            upload: Upload::Done,
            request_method: None,
            eof_seen: false,
            terminated: false,
        }
    }

    fn encode_head(&mut self, request: &Request, body: &RequestBody) {
        let mut head = String::with_capacity(256);
        let _ = write!(
            head,
            "{} {} {}\r\n",
            request.method, request.target, request.version
        );
        let mut has_length = false;
        let mut has_te = false;
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("content-length") {
                has_length = true;
            }
            if name.eq_ignore_ascii_case("transfer-encoding") {
                has_te = true;
            }
            let _ = write!(head, "{name}: {value}\r\n");
        }
        match body {
            RequestBody::Strict(bytes) => {
                if !has_length && !bytes.is_empty() {
                    let _ = write!(head, "Content-Length: {}\r\n", bytes.len());
                }
            }
            RequestBody::Streamed(_) => {
                if !has_te {
                    head.push_str("Transfer-Encoding: chunked\r\n");
                }
            }
        }
        head.push_str("\r\n");
        self.write_buf.extend_from_slice(head.as_bytes());
    }

    /// Drives the streamed upload, chunk-framing body data into the write
    /// buffer.
    fn pump_upload(&mut self, out: &mut Vec<WireEvent>) {
        loop {
            let Upload::Streaming { body, started } = &mut self.upload else {
                return;
            };
            match body.poll_chunk() {
                BodyPoll::Pending => return,
                BodyPoll::Chunk(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if !*started {
                        *started = true;
                        out.push(WireEvent::RequestBodyProgress);
                    }
                    let mut size_line = String::with_capacity(16);
                    let _ = write!(size_line, "{:X}\r\n", chunk.len());
                    self.write_buf.extend_from_slice(size_line.as_bytes());
                    self.write_buf.extend_from_slice(&chunk);
                    self.write_buf.extend_from_slice(b"\r\n");
                }
                BodyPoll::End => {
                    self.write_buf.extend_from_slice(b"0\r\n\r\n");
                    self.upload = Upload::Done;
                    out.push(WireEvent::RequestBodyComplete);
                    return;
                }
                BodyPoll::Failed(cause) => {
                    self.upload = Upload::Done;
                    out.push(WireEvent::RequestBodyFailed(cause));
                    return;
                }
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<WireEvent>) {
        while !self.write_buf.is_empty() {
            match self.transport.try_write(&self.write_buf) {
                Ok(0) => return,
                Ok(written) => {
                    self.write_buf.drain(..written);
                }
                Err(e) => {
                    self.terminate(out, format!("write failed: {e}"));
                    return;
                }
            }
        }
    }

    fn fill(&mut self, out: &mut Vec<WireEvent>) {
        let mut scratch = [0u8; 8192];
        loop {
            match self.transport.try_read(&mut scratch) {
                Ok(ReadOutcome::WouldBlock) => return,
                Ok(ReadOutcome::Eof) => {
                    self.eof_seen = true;
                    return;
                }
                Ok(ReadOutcome::Data(n)) => {
                    self.read_buf.extend_from_slice(&scratch[..n]);
                }
                Err(e) => {
                    self.terminate(out, format!("read failed: {e}"));
                    return;
                }
            }
        }
    }

    fn terminate(&mut self, out: &mut Vec<WireEvent>, cause: String) {
        if !self.terminated {
            self.terminated = true;
            out.push(WireEvent::Failed(cause));
        }
    }

    /// Runs the response decoder over the read buffer.
    ///
    /// The state is moved out for each step so the arms can freely touch the
    /// buffers; every exit path puts the (possibly advanced) state back.
    fn decode(&mut self, out: &mut Vec<WireEvent>) {
        loop {
            let state = std::mem::replace(&mut self.decode, DecodeState::Quiet);
            match state {
                DecodeState::Quiet => return,

                DecodeState::Head => {
                    let Some(end) = find_headers_end(&self.read_buf) else {
                        if self.read_buf.len() > MAX_HEADERS_SIZE {
                            self.terminate(out, "response header block too large".into());
                        } else {
                            self.decode = DecodeState::Head;
                        }
                        return;
                    };
                    if end > MAX_HEADERS_SIZE {
                        self.terminate(out, "response header block too large".into());
                        return;
                    }
                    let head_bytes: Vec<u8> = self.read_buf.drain(..end).collect();
                    let head = match parse_head(&head_bytes) {
                        Ok(head) => head,
                        Err(cause) => {
                            self.terminate(out, cause);
                            return;
                        }
                    };

                    if head.header("Transfer-Encoding").is_some()
                        && head.header("Content-Length").is_some()
                    {
                        // RFC 9112 6.3: reject ambiguous framing outright.
                        self.terminate(
                            out,
                            "both Content-Length and Transfer-Encoding present".into(),
                        );
                        return;
                    }

                    let is_head_request = self.request_method == Some(Method::Head);
                    let bodyless = is_head_request || head.status_forbids_body();
                    let chunked = head.is_chunked();
                    let content_length = head.content_length();

                    out.push(WireEvent::ResponseHead(head));
                    self.decode = if bodyless {
                        DecodeState::Quiet
                    } else if chunked {
                        DecodeState::Chunked(ChunkState::SizeLine)
                    } else if let Some(length) = content_length {
                        if length == 0 {
                            out.push(WireEvent::ResponseEnd);
                            DecodeState::Quiet
                        } else {
                            DecodeState::FixedBody { remaining: length }
                        }
                    } else {
                        DecodeState::EofBody
                    };
                }

                DecodeState::FixedBody { remaining } => {
                    if self.read_buf.is_empty() {
                        self.decode = DecodeState::FixedBody { remaining };
                        return;
                    }
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(self.read_buf.len());
                    let chunk: Vec<u8> = self.read_buf.drain(..take).collect();
                    let left = remaining - take as u64;
                    out.push(WireEvent::ResponseChunk(chunk));
                    if left == 0 {
                        out.push(WireEvent::ResponseEnd);
                        self.decode = DecodeState::Quiet;
                    } else {
                        self.decode = DecodeState::FixedBody { remaining: left };
                    }
                }

                DecodeState::Chunked(chunk_state) => match chunk_state {
                    ChunkState::SizeLine => {
                        let Some(line_end) = find_crlf(&self.read_buf) else {
                            self.decode = DecodeState::Chunked(ChunkState::SizeLine);
                            return;
                        };
                        let line: Vec<u8> = self.read_buf.drain(..line_end + 2).collect();
                        let size = match parse_chunk_size(&line[..line_end]) {
                            Ok(size) => size,
                            Err(cause) => {
                                self.terminate(out, cause);
                                return;
                            }
                        };
                        self.decode = if size == 0 {
                            DecodeState::Chunked(ChunkState::Trailers)
                        } else {
                            DecodeState::Chunked(ChunkState::Data { remaining: size })
                        };
                    }
                    ChunkState::Data { remaining } => {
                        if self.read_buf.is_empty() {
                            self.decode = DecodeState::Chunked(ChunkState::Data { remaining });
                            return;
                        }
                        let take = remaining.min(self.read_buf.len());
                        let chunk: Vec<u8> = self.read_buf.drain(..take).collect();
                        let left = remaining - take;
                        out.push(WireEvent::ResponseChunk(chunk));
                        self.decode = if left == 0 {
                            DecodeState::Chunked(ChunkState::DataCrlf)
                        } else {
                            DecodeState::Chunked(ChunkState::Data { remaining: left })
                        };
                    }
                    ChunkState::DataCrlf => {
                        if self.read_buf.len() < 2 {
                            self.decode = DecodeState::Chunked(ChunkState::DataCrlf);
                            return;
                        }
                        if &self.read_buf[..2] != b"\r\n" {
                            self.terminate(out, "malformed chunked encoding".into());
                            return;
                        }
                        self.read_buf.drain(..2);
                        self.decode = DecodeState::Chunked(ChunkState::SizeLine);
                    }
                    ChunkState::Trailers => {
                        let Some(line_end) = find_crlf(&self.read_buf) else {
                            self.decode = DecodeState::Chunked(ChunkState::Trailers);
                            return;
                        };
                        let _line: Vec<u8> = self.read_buf.drain(..line_end + 2).collect();
                        if line_end == 0 {
                            out.push(WireEvent::ResponseEnd);
                            self.decode = DecodeState::Quiet;
                        } else {
                            // Trailer fields are dropped; the pool surfaces
                            // entity data only.
                            self.decode = DecodeState::Chunked(ChunkState::Trailers);
                        }
                    }
                },

                DecodeState::EofBody => {
                    if !self.read_buf.is_empty() {
                        let chunk: Vec<u8> = self.read_buf.drain(..).collect();
                        out.push(WireEvent::ResponseChunk(chunk));
                    }
                    if self.eof_seen {
                        out.push(WireEvent::ResponseEnd);
                        self.decode = DecodeState::Quiet;
                    } else {
                        self.decode = DecodeState::EofBody;
                    }
                    return;
                }
            }
        }
    }

    fn handle_eof(&mut self, out: &mut Vec<WireEvent>) {
        if !self.eof_seen || self.terminated {
            return;
        }
        match self.decode {
            // EOF with no response outstanding, or between requests: orderly.
            DecodeState::Quiet => {
                self.terminated = true;
                out.push(WireEvent::Closed);
            }
            // Before any response byte: orderly close; the slot decides
            // whether a transparent retry applies.
            DecodeState::Head if self.read_buf.is_empty() => {
                self.terminated = true;
                out.push(WireEvent::Closed);
            }
            DecodeState::Head => {
                self.terminate(out, "connection closed inside response head".into());
            }
            DecodeState::FixedBody { .. } | DecodeState::Chunked(_) => {
                self.terminate(out, "connection closed inside response body".into());
            }
            // EofBody completion is handled by the decoder.
            DecodeState::EofBody => {}
        }
    }
}

impl<T: ByteTransport> Connection for EngineConnection<T> {
    fn dispatch(&mut self, request: &Request, body: RequestBody) {
        debug_assert!(
            matches!(self.decode, DecodeState::Quiet),
            "dispatch with a response outstanding"
        );
        self.request_method = Some(request.method.clone());
        self.encode_head(request, &body);
        match body {
            RequestBody::Strict(bytes) => {
                self.write_buf.extend_from_slice(&bytes);
                self.upload = Upload::Done;
            }
            body @ RequestBody::Streamed(_) => {
                self.upload = Upload::Streaming {
                    body,
                    started: false,
                };
            }
        }
        self.decode = DecodeState::Head;
    }

    fn poll(&mut self, _now: Time, out: &mut Vec<WireEvent>) {
        if self.terminated {
            return;
        }
        self.pump_upload(out);
        self.flush(out);
        if self.terminated {
            return;
        }
        self.fill(out);
        if self.terminated {
            return;
        }
        self.decode(out);
        self.handle_eof(out);
    }

    fn abort(&mut self) {
        self.terminated = true;
        self.transport.abort();
    }

    fn close(&mut self) {
        // Best effort: push out whatever is buffered, then shut down.
        let mut discard = Vec::new();
        self.flush(&mut discard);
        self.terminated = true;
        self.transport.close();
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(line).map_err(|_| "malformed chunk size".to_owned())?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    if size_part.is_empty() {
        return Err("malformed chunk size".to_owned());
    }
    usize::from_str_radix(size_part, 16).map_err(|_| "malformed chunk size".to_owned())
}

/// Parses `HTTP/1.1 200 OK` plus the header block.
fn parse_head(bytes: &[u8]) -> Result<ResponseHead, String> {
    let text =
        std::str::from_utf8(bytes).map_err(|_| "response head is not valid UTF-8".to_owned())?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or("missing status line")?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(|v| Version::from_bytes(v.as_bytes()))
        .ok_or("unsupported HTTP version")?;
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or("malformed status code")?;
    let reason = parts.next().unwrap_or("").to_owned();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon = line.find(':').ok_or("malformed header line")?;
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        if name.is_empty() {
            return Err("empty header name".to_owned());
        }
        headers.push((name.to_owned(), value.to_owned()));
        if headers.len() > MAX_HEADERS {
            return Err("too many headers".to_owned());
        }
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}
