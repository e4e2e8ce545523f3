//! Streaming HTTP/1.x request header transform
//!
//! Sits between an accepted tunnel stream and the target socket. Request
//! header blocks are parsed incrementally and re-emitted with the
//! configured rewrites and replacements applied; everything else passes
//! through byte for byte:
//!
//! ```text
//! ingress bytes ──► [Headers] ──► header block rewritten
//!                       │
//!                       ├─► [Body]     Content-Length bytes, verbatim
//!                       ├─► [Chunked]  chunked framing tracked, verbatim
//!                       └─► [Bypass]   upgrade or unparseable input,
//!                                      verbatim until the stream ends
//! ```
//!
//! Header lines that no rule touches are copied from the input unchanged,
//! so traffic that matches no rule comes out identical to what went in.

use crate::config::TransformRules;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace};
use url::{Position, Url};

/// Largest header block buffered before giving up on parsing
pub const MAX_HEADER_BLOCK: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Headers,
    Body { remaining: u64 },
    Chunked(Chunk),
    Bypass,
}

enum Framing {
    None,
    Length(u64),
    Chunked,
    Upgrade,
    Invalid,
}

pub struct HttpTransform {
    rules: Arc<TransformRules>,
    /// `host[:port]` of the target, port only when not the scheme default
    target_authority: String,
    /// `scheme://host[:port]` of the target
    target_origin: String,
    ingress_host: Option<String>,
    state: State,
    headers: Vec<u8>,
    line: Vec<u8>,
}

impl std::fmt::Debug for HttpTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransform")
            .field("target", &self.target_origin)
            .field("ingress_host", &self.ingress_host)
            .field("state", &self.state)
            .finish()
    }
}

impl HttpTransform {
    pub fn new(rules: Arc<TransformRules>, target_url: &Url, ingress_url: &Url) -> Self {
        let host = target_url.host_str().unwrap_or_default();
        let target_authority = match target_url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let target_origin = format!("{}://{}", target_url.scheme(), target_authority);

        Self {
            rules,
            target_authority,
            target_origin,
            ingress_host: ingress_url.host_str().map(str::to_ascii_lowercase),
            state: State::Headers,
            headers: Vec::new(),
            line: Vec::new(),
        }
    }

    /// True once the transform passes everything through untouched.
    pub fn is_bypassed(&self) -> bool {
        self.state == State::Bypass
    }

    /// Feed the next chunk read from the tunnel stream, returning the bytes
    /// to write to the target.
    pub fn transform(&mut self, chunk: &[u8]) -> Bytes {
        if self.state == State::Bypass {
            return Bytes::copy_from_slice(chunk);
        }

        let mut out = BytesMut::with_capacity(chunk.len() + 64);
        let mut data: Vec<u8>;
        let mut input: &[u8] = chunk;

        while !input.is_empty() {
            match self.state {
                State::Bypass => {
                    out.extend_from_slice(input);
                    break;
                }
                State::Body { remaining } => {
                    let n = remaining.min(input.len() as u64) as usize;
                    out.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::Headers
                    } else {
                        State::Body { remaining }
                    };
                }
                State::Chunked(_) => {
                    let n = self.step_chunked(input, &mut out);
                    input = &input[n..];
                }
                State::Headers => {
                    self.headers.extend_from_slice(input);
                    match self.parse_header_block(&mut out) {
                        Some(rest) => {
                            data = rest;
                            input = &data;
                        }
                        None => break,
                    }
                }
            }
        }

        out.freeze()
    }

    /// Try to complete the buffered header block. Returns the bytes that
    /// followed it, or `None` when more input is needed or the transform
    /// went into bypass.
    fn parse_header_block(&mut self, out: &mut BytesMut) -> Option<Vec<u8>> {
        let block = std::mem::take(&mut self.headers);
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        match request.parse(&block) {
            Ok(httparse::Status::Complete(len)) => {
                let framing = self.emit_header_block(&block, len, request.headers, out);
                trace!(
                    "HTTP request: {} {}",
                    request.method.unwrap_or_default(),
                    request.path.unwrap_or_default()
                );
                self.state = match framing {
                    Framing::None | Framing::Length(0) => State::Headers,
                    Framing::Length(remaining) => State::Body { remaining },
                    Framing::Chunked => State::Chunked(Chunk::Size),
                    Framing::Upgrade => {
                        trace!("upgrade request, disabling transform");
                        State::Bypass
                    }
                    Framing::Invalid => {
                        debug!("Unsupported request framing, disabling transform");
                        State::Bypass
                    }
                };
                Some(block[len..].to_vec())
            }
            Ok(httparse::Status::Partial) if block.len() <= MAX_HEADER_BLOCK => {
                self.headers = block;
                None
            }
            Ok(httparse::Status::Partial) => {
                debug!("Request header block exceeds {} bytes, disabling transform", MAX_HEADER_BLOCK);
                out.extend_from_slice(&block);
                self.state = State::Bypass;
                None
            }
            Err(e) => {
                debug!("Unparseable request ({}), disabling transform", e);
                out.extend_from_slice(&block);
                self.state = State::Bypass;
                None
            }
        }
    }

    fn emit_header_block(
        &self,
        block: &[u8],
        len: usize,
        headers: &[httparse::Header<'_>],
        out: &mut BytesMut,
    ) -> Framing {
        let base = block.as_ptr() as usize;
        let mut cursor = 0;

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut upgrade = false;
        let mut invalid = false;

        for header in headers {
            let start = header.name.as_ptr() as usize - base;
            let name_end = start + header.name.len();
            let line_end = block[name_end..len]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(len, |i| name_end + i + 1);

            // Request line and anything else between headers
            out.extend_from_slice(&block[cursor..start]);
            cursor = line_end;

            let value = std::str::from_utf8(header.value).ok();
            match value.and_then(|v| self.transform_header(header.name, v)) {
                None => out.extend_from_slice(&block[start..line_end]),
                Some(None) => trace!("  dropped {}", header.name),
                Some(Some(new_value)) => {
                    trace!("  {}: {}", header.name, new_value);
                    out.extend_from_slice(header.name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(new_value.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
            }

            // Framing is decided from what the client sent
            let raw = String::from_utf8_lossy(header.value);
            if header.name.eq_ignore_ascii_case("connection") {
                upgrade |= has_token(&raw, "upgrade");
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = raw
                    .rsplit(',')
                    .next()
                    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
            } else if header.name.eq_ignore_ascii_case("content-length") {
                match raw.trim().parse::<u64>() {
                    Ok(n) if content_length.map_or(true, |prev| prev == n) => {
                        content_length = Some(n)
                    }
                    _ => invalid = true,
                }
            }
        }

        out.extend_from_slice(&block[cursor..len]);

        if upgrade {
            Framing::Upgrade
        } else if chunked {
            Framing::Chunked
        } else if invalid {
            Framing::Invalid
        } else if let Some(n) = content_length {
            Framing::Length(n)
        } else {
            Framing::None
        }
    }

    /// `None` leaves the header untouched, `Some(None)` drops it and
    /// `Some(Some(v))` replaces its value.
    fn transform_header(&self, name: &str, value: &str) -> Option<Option<String>> {
        if self.rules.rewrites(name) {
            let rewritten = self.rewrite_value(value)?;
            return (rewritten != value).then_some(Some(rewritten));
        }

        match self.rules.replacement(name) {
            Some("") => Some(None),
            Some(replacement) if replacement != value => Some(Some(replacement.to_string())),
            _ => None,
        }
    }

    fn rewrite_value(&self, value: &str) -> Option<String> {
        let looks_like_url = value
            .get(..4)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("http"));

        if looks_like_url {
            if let Ok(url) = Url::parse(value) {
                if matches!(url.scheme(), "http" | "https") {
                    let host = url.host_str()?;
                    if !self
                        .ingress_host
                        .as_deref()
                        .is_some_and(|ingress| ingress.eq_ignore_ascii_case(host))
                    {
                        return None;
                    }

                    let mut suffix = &url[Position::BeforePath..];
                    if suffix == "/" && !value.ends_with('/') {
                        suffix = "";
                    }
                    return Some(format!("{}{}", self.target_origin, suffix));
                }
            }
        }

        Some(self.target_authority.clone())
    }

    /// Pass chunked body bytes through while tracking the framing. Returns
    /// the number of input bytes consumed.
    fn step_chunked(&mut self, input: &[u8], out: &mut BytesMut) -> usize {
        let State::Chunked(chunk) = self.state else {
            return 0;
        };

        if let Chunk::Data { remaining } = chunk {
            let n = remaining.min(input.len() as u64) as usize;
            out.extend_from_slice(&input[..n]);
            let remaining = remaining - n as u64;
            self.state = State::Chunked(if remaining == 0 {
                Chunk::DataEnd
            } else {
                Chunk::Data { remaining }
            });
            return n;
        }

        let (consumed, complete) = match input.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (input.len(), false),
        };
        out.extend_from_slice(&input[..consumed]);
        self.line.extend_from_slice(&input[..consumed]);

        if !complete {
            if self.line.len() > MAX_CHUNK_LINE {
                self.line.clear();
                self.state = State::Bypass;
            }
            return consumed;
        }

        let line = std::mem::take(&mut self.line);
        let text = trim_line(&line);
        self.state = match chunk {
            Chunk::Size => match parse_chunk_size(text) {
                Some(0) => State::Chunked(Chunk::Trailer),
                Some(size) => State::Chunked(Chunk::Data { remaining: size }),
                None => {
                    debug!("Invalid chunk size line, disabling transform");
                    State::Bypass
                }
            },
            Chunk::DataEnd if text.is_empty() => State::Chunked(Chunk::Size),
            Chunk::DataEnd => State::Bypass,
            Chunk::Trailer if text.is_empty() => State::Headers,
            Chunk::Trailer => State::Chunked(Chunk::Trailer),
            Chunk::Data { remaining } => State::Chunked(Chunk::Data { remaining }),
        };
        consumed
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let size = line.split(|&b| b == b';').next()?;
    let size = std::str::from_utf8(size).ok()?.trim();
    u64::from_str_radix(size, 16).ok()
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}
