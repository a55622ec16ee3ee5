/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Splitting of CGI program output into a response head and body.

use crate::core::buffer::{find, trim_for_display, trim_line_end, ParseBuffer};
use crate::response::HttpResponseWriter;
use crate::ParseOutcome;
use log::debug;
use std::io;

pub const HEADER_MAX_DEFAULT: usize = 8192;

const HEADER_BUFFER_INITIAL: usize = 1024;

// in order of preference. the earliest match in the input wins
const SEPARATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r\n\r\r\n"];

const SEPARATOR_MAX: usize = 6;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum CgiHeaderState {
    // call: feed, finish
    // next: AwaitingHeaderLine, Seen, Error
    AwaitingHeaderLine,

    // call: feed, finish
    // next: Seen, Completed, Error
    Seen,

    // finish succeeded
    Completed,

    Error,

    Aborted,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Completion {
    Done,

    // re-dispatch the request against a local path
    InternalReRoute(String),

    // send the client a redirect
    ExternalRedirect { code: u16, location: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed header line")]
    HeaderLineMalformed,

    #[error("headers never seen")]
    HeadersNeverSeen,

    #[error("gateway process failed with exit code {0}")]
    GatewayProcessFailed(i32),

    #[error("header block too large")]
    BufferOverflow,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("parser aborted")]
    Aborted,
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::HeaderLineMalformed | Error::HeadersNeverSeen | Error::GatewayProcessFailed(_) => {
                503
            }
            Error::BufferOverflow => 504,
            Error::Io(_) | Error::Aborted => 500,
        }
    }
}

// returns (end of header block, start of body)
fn find_separator(buf: &[u8]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;

    for sep in SEPARATORS.iter() {
        if let Some(pos) = find(buf, sep) {
            if best.map_or(true, |(cur, _)| pos < cur) {
                best = Some((pos, pos + sep.len()));
            }
        }
    }

    best
}

// splits on the first colon or whitespace
fn split_header_line(line: &str) -> Option<(&str, &str)> {
    let pos = line.find(|c: char| c == ':' || c == ' ' || c == '\t')?;

    let name = &line[..pos];
    if name.is_empty() {
        return None;
    }

    let value = line[pos..].trim_start();
    let value = value.strip_prefix(':').unwrap_or(value);

    Some((name, value.trim()))
}

fn parse_status(value: &str) -> Option<u16> {
    let code: u16 = value.split_whitespace().next()?.parse().ok()?;

    if (100..1000).contains(&code) {
        Some(code)
    } else {
        None
    }
}

/// Decodes the output of a CGI program into response headers and body.
///
/// Until the header block is complete, input is buffered (up to a max
/// size). Afterwards, input is passed to the writer as body without
/// further inspection. In non-parsed-header mode, all input is body.
pub struct CgiResponseParser {
    state: CgiHeaderState,
    nph: bool,
    buf: ParseBuffer,
    max_header: usize,
    status: Option<u16>,
    location: Option<String>,
    body_size: u64,
}

impl CgiResponseParser {
    pub fn new(nph: bool, max_header: usize) -> Self {
        let mut p = Self {
            state: CgiHeaderState::AwaitingHeaderLine,
            nph: false,
            buf: ParseBuffer::new(0, 0),
            max_header,
            status: None,
            location: None,
            body_size: 0,
        };

        p.initialize(nph);

        p
    }

    pub fn initialize(&mut self, nph: bool) {
        self.nph = nph;
        self.status = None;
        self.location = None;
        self.body_size = 0;

        if nph {
            self.buf = ParseBuffer::new(0, 0);
            self.state = CgiHeaderState::Seen;
        } else {
            // the separator doesn't count against the header limit
            let max = self.max_header.saturating_add(SEPARATOR_MAX);
            let initial = std::cmp::min(HEADER_BUFFER_INITIAL, max);

            self.buf = ParseBuffer::new(initial, max);
            self.state = CgiHeaderState::AwaitingHeaderLine;
        }
    }

    pub fn state(&self) -> CgiHeaderState {
        self.state
    }

    pub fn is_nph(&self) -> bool {
        self.nph
    }

    // status code set by a Status header, if any
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    pub fn feed<W: HttpResponseWriter>(
        &mut self,
        chunk: &[u8],
        writer: &mut W,
    ) -> Result<ParseOutcome, Error> {
        match self.state {
            CgiHeaderState::Seen => {
                self.write_body(chunk, writer)?;

                Ok(ParseOutcome::NeedMoreData)
            }
            CgiHeaderState::AwaitingHeaderLine => match self.feed_header(chunk, writer) {
                Ok(ret) => Ok(ret),
                Err(e) => {
                    debug!("cgi: {}", e);

                    self.buf.release();
                    self.state = CgiHeaderState::Error;

                    Err(e)
                }
            },
            CgiHeaderState::Completed | CgiHeaderState::Error | CgiHeaderState::Aborted => {
                Err(Error::Aborted)
            }
        }
    }

    /// Called once the program's output has ended, with its exit code.
    pub fn finish(&mut self, exit_code: i32) -> Result<Completion, Error> {
        match self.state {
            CgiHeaderState::Completed | CgiHeaderState::Error | CgiHeaderState::Aborted => {
                return Err(Error::Aborted)
            }
            _ => {}
        }

        if exit_code != 0 {
            self.state = CgiHeaderState::Error;

            return Err(Error::GatewayProcessFailed(exit_code));
        }

        if self.state != CgiHeaderState::Seen {
            debug!(
                "cgi: output ended with {} bytes of incomplete headers",
                self.buf.read_avail()
            );

            self.buf.release();
            self.state = CgiHeaderState::Error;

            return Err(Error::HeadersNeverSeen);
        }

        self.state = CgiHeaderState::Completed;

        let location = match self.location.take() {
            Some(location) => location,
            None => return Ok(Completion::Done),
        };

        if location.starts_with('/') {
            debug!("cgi: internal reroute to {}", trim_for_display(&location, 128));

            return Ok(Completion::InternalReRoute(location));
        }

        let code = match self.status {
            Some(code) if (300..400).contains(&code) => code,
            _ => 302,
        };

        debug!("cgi: redirect {} to {}", code, trim_for_display(&location, 128));

        Ok(Completion::ExternalRedirect { code, location })
    }

    pub fn abort(&mut self) {
        self.buf.release();
        self.location = None;
        self.state = CgiHeaderState::Aborted;
    }

    fn write_body<W: HttpResponseWriter>(
        &mut self,
        data: &[u8],
        writer: &mut W,
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        writer.write_body(data)?;
        self.body_size += data.len() as u64;

        Ok(())
    }

    fn feed_header<W: HttpResponseWriter>(
        &mut self,
        chunk: &[u8],
        writer: &mut W,
    ) -> Result<ParseOutcome, Error> {
        let size = self.buf.append(chunk);

        let (header_end, body_start) = match find_separator(self.buf.read_buf()) {
            Some(ret) => ret,
            None => {
                if size < chunk.len() {
                    return Err(Error::BufferOverflow);
                }

                return Ok(ParseOutcome::NeedMoreData);
            }
        };

        if header_end > self.max_header {
            return Err(Error::BufferOverflow);
        }

        let block = self.buf.read_buf()[..header_end].to_vec();
        self.buf.read_commit(body_start);

        self.apply_headers(&block, writer)?;

        self.state = CgiHeaderState::Seen;

        debug!(
            "cgi: headers complete, status={:?} location={}",
            self.status,
            self.location.is_some()
        );

        // body bytes that arrived along with the headers
        let rest = self.buf.read_buf().to_vec();
        self.buf.release();

        self.write_body(&rest, writer)?;
        self.write_body(&chunk[size..], writer)?;

        Ok(ParseOutcome::NeedMoreData)
    }

    fn apply_headers<W: HttpResponseWriter>(
        &mut self,
        block: &[u8],
        writer: &mut W,
    ) -> Result<(), Error> {
        for line in block.split(|b| *b == b'\n') {
            let line = trim_line_end(line);

            if line.is_empty() {
                continue;
            }

            let line = String::from_utf8_lossy(line);

            let (name, value) = match split_header_line(&line) {
                Some(ret) => ret,
                None => return Err(Error::HeaderLineMalformed),
            };

            if name.eq_ignore_ascii_case("Location") {
                self.location = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("Status") {
                let code = match parse_status(value) {
                    Some(code) => code,
                    None => return Err(Error::HeaderLineMalformed),
                };

                self.status = Some(code);
                writer.set_status_code(code);
            } else if name.eq_ignore_ascii_case("Content-Type") {
                writer.set_mime_type(value);
            } else {
                writer.add_header(name, value);
            }
        }

        Ok(())
    }
}
