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

//! Incremental `multipart/form-data` decoding.
//!
//! The parser accepts body bytes in chunks of any size and emits form fields
//! and file uploads as soon as each part is known to be complete. File part
//! data is streamed to temporary files, holding back only enough trailing
//! bytes to recognize a delimiter that straddles two chunks.

use crate::core::buffer::{find, find_byte, trim_for_display, trim_line_end, ParseBuffer};
use crate::upload::{FileUpload, FormField, FormFieldSink, TempFileFactory};
use crate::ParseOutcome;
use log::debug;
use std::cmp;
use std::io::{self, Read, Write};
use std::path::PathBuf;

pub const BUFFER_SIZE_DEFAULT: usize = 4096;
pub const BUFFER_MAX_DEFAULT: usize = 65536;
pub const BODY_MAX_DEFAULT: u64 = 100 * 1024 * 1024;
pub const UPLOAD_MAX_DEFAULT: u64 = 100 * 1024 * 1024;
pub const FIELD_MAX_DEFAULT: u64 = 65536;

// room for the delimiter line plus its line break and closing dashes
const BOUNDARY_OVERHEAD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // initial buffer allocation
    pub buffer_size: usize,

    // max unconsumed bytes held between calls
    pub max_buffer: usize,

    // max total bytes fed
    pub max_body: u64,

    // max size of each file part
    pub max_upload_size: u64,

    // max size of each in-memory field value
    pub max_field_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            buffer_size: BUFFER_SIZE_DEFAULT,
            max_buffer: BUFFER_MAX_DEFAULT,
            max_body: BODY_MAX_DEFAULT,
            max_upload_size: UPLOAD_MAX_DEFAULT,
            max_field_size: FIELD_MAX_DEFAULT,
        }
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum MultipartState {
    // call: feed
    // next: AwaitingPartHeader, Complete
    AwaitingBoundary,

    // call: feed
    // next: AwaitingPartHeader, ReceivingPartData
    AwaitingPartHeader,

    // call: feed
    // next: ReceivingPartData, AwaitingBoundary
    ReceivingPartData,

    // closing delimiter seen. remaining input is ignored
    Complete,

    // aborted by the caller or by an error
    Aborted,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid boundary")]
    InvalidBoundary,

    #[error("body too large")]
    BodyTooLarge,

    #[error("malformed boundary")]
    MalformedBoundary,

    #[error("malformed part header")]
    MalformedPartHeader,

    #[error("missing name field")]
    MissingNameField,

    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("failed to read body: {0}")]
    Read(io::Error),

    #[error("body ended before the closing boundary")]
    Truncated,

    #[error("parser aborted")]
    Aborted,
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidBoundary
            | Error::BodyTooLarge
            | Error::MalformedBoundary
            | Error::MalformedPartHeader
            | Error::MissingNameField
            | Error::Read(_)
            | Error::Truncated => 400,
            Error::Storage(_) | Error::Aborted => 500,
        }
    }
}

/// Extracts the boundary parameter from a `multipart/form-data` content
/// type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mime = match content_type.find(';') {
        Some(pos) => &content_type[..pos],
        None => content_type,
    };

    if !mime.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }

    for (name, value) in header_params(content_type) {
        if name.eq_ignore_ascii_case("boundary") && !value.is_empty() {
            return Some(value);
        }
    }

    None
}

// parses the `name=value` parameters following the first `;` of a header
// value. quoted values have their quotes removed. no escape processing is
// done, since browsers send windows paths in filename unescaped
fn header_params(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();

    let mut rest = match value.find(';') {
        Some(pos) => &value[(pos + 1)..],
        None => return out,
    };

    loop {
        rest = rest.trim_start_matches(|c: char| c == ' ' || c == '\t' || c == ';');

        if rest.is_empty() {
            break;
        }

        let pos = match rest.find(|c: char| c == '=' || c == ';') {
            Some(pos) => pos,
            None => break,
        };

        if rest.as_bytes()[pos] == b';' {
            // parameter without value
            rest = &rest[pos..];
            continue;
        }

        let name = rest[..pos].trim().to_string();
        rest = rest[(pos + 1)..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    rest = &quoted[(end + 1)..];

                    quoted[..end].to_string()
                }
                None => {
                    rest = "";

                    quoted.to_string()
                }
            }
        } else {
            let end = rest.find(';').unwrap_or(rest.len());
            let v = rest[..end].trim().to_string();
            rest = &rest[end..];

            v
        };

        out.push((name, value));
    }

    out
}

fn trim_padding(s: &[u8]) -> &[u8] {
    let mut end = s.len();

    while end > 0 && (s[end - 1] == b' ' || s[end - 1] == b'\t') {
        end -= 1;
    }

    &s[..end]
}

enum PartSink<W> {
    // header block still being read
    Headers,
    Value(Vec<u8>),
    File { file: W, path: PathBuf },
}

struct PartDescriptor<W> {
    field_name: Option<String>,
    file_name: Option<String>,
    content_type: Option<String>,
    bytes_written: u64,
    sink: PartSink<W>,
}

impl<W: Write> PartDescriptor<W> {
    fn new() -> Self {
        Self {
            field_name: None,
            file_name: None,
            content_type: None,
            bytes_written: 0,
            sink: PartSink::Headers,
        }
    }

    fn apply_disposition(&mut self, value: &str) -> Result<(), Error> {
        for (name, v) in header_params(value) {
            if name.eq_ignore_ascii_case("name") {
                self.field_name = Some(v);
            } else if name.eq_ignore_ascii_case("filename") {
                if self.field_name.is_none() {
                    return Err(Error::MissingNameField);
                }

                self.file_name = Some(v);
            }
        }

        Ok(())
    }

    // limits are checked before anything is written
    fn write(&mut self, data: &[u8], limits: &Limits) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        let size = self.bytes_written + (data.len() as u64);

        match &mut self.sink {
            PartSink::Headers => return Ok(()),
            PartSink::Value(v) => {
                if size > limits.max_field_size {
                    return Err(Error::BodyTooLarge);
                }

                v.extend_from_slice(data);
            }
            PartSink::File { file, .. } => {
                if size > limits.max_upload_size {
                    return Err(Error::BodyTooLarge);
                }

                file.write_all(data)?;
            }
        }

        self.bytes_written = size;

        Ok(())
    }
}

/// Decodes a `multipart/form-data` body fed in arbitrary chunks.
///
/// Not thread-safe: callers sharing an instance across threads must
/// serialize calls to `feed` and `abort`.
pub struct MultipartParser<F: TempFileFactory> {
    factory: F,
    limits: Limits,
    state: MultipartState,

    // "--" + boundary
    delimiter: Vec<u8>,

    // "\n--" + boundary, searched for within part data
    data_end: Vec<u8>,

    buf: ParseBuffer,
    part: Option<PartDescriptor<F::File>>,
    files: Vec<FileUpload>,
    body_size: u64,
}

impl<F: TempFileFactory> MultipartParser<F> {
    pub fn new(boundary: &[u8], factory: F, limits: Limits) -> Result<Self, Error> {
        let mut p = Self {
            factory,
            limits,
            state: MultipartState::Aborted,
            delimiter: Vec::new(),
            data_end: Vec::new(),
            buf: ParseBuffer::new(0, 0),
            part: None,
            files: Vec::new(),
            body_size: 0,
        };

        p.initialize(boundary)?;

        Ok(p)
    }

    /// Prepares the parser for a new body. Any part in progress is
    /// discarded as if aborted.
    pub fn initialize(&mut self, boundary: &[u8]) -> Result<(), Error> {
        self.cleanup();

        if boundary.is_empty() || boundary.iter().any(|b| *b == b'\r' || *b == b'\n') {
            return Err(Error::InvalidBoundary);
        }

        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary);

        if delimiter.len() + BOUNDARY_OVERHEAD > self.limits.max_buffer {
            return Err(Error::InvalidBoundary);
        }

        let mut data_end = Vec::with_capacity(delimiter.len() + 1);
        data_end.push(b'\n');
        data_end.extend_from_slice(&delimiter);

        let initial = cmp::min(self.limits.buffer_size, self.limits.max_buffer);

        self.delimiter = delimiter;
        self.data_end = data_end;
        self.buf = ParseBuffer::new(initial, self.limits.max_buffer);
        self.files.clear();
        self.body_size = 0;
        self.state = MultipartState::AwaitingBoundary;

        Ok(())
    }

    pub fn state(&self) -> MultipartState {
        self.state
    }

    /// Completed file uploads so far.
    pub fn files(&self) -> &[FileUpload] {
        &self.files
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Consumes `chunk` and emits any parts it completes to `sink`.
    ///
    /// On error, the parser is aborted: a partially written file is deleted
    /// and further calls return `Error::Aborted`.
    pub fn feed<S: FormFieldSink>(
        &mut self,
        chunk: &[u8],
        sink: &mut S,
    ) -> Result<ParseOutcome, Error> {
        match self.state {
            MultipartState::Aborted => return Err(Error::Aborted),
            MultipartState::Complete => return Ok(ParseOutcome::Complete),
            _ => {}
        }

        match self.feed_inner(chunk, sink) {
            Ok(ret) => Ok(ret),
            Err(e) => {
                debug!("multipart: {}, aborting", e);

                self.cleanup();

                Err(e)
            }
        }
    }

    /// Discards any part in progress, deleting its temporary file.
    pub fn abort(&mut self) {
        if self.state != MultipartState::Aborted {
            debug!("multipart: aborted in state {:?}", self.state);
        }

        self.cleanup();
    }

    fn cleanup(&mut self) {
        if let Some(part) = self.part.take() {
            if let PartSink::File { file, path } = part.sink {
                if let Err(e) = self.factory.close(file) {
                    debug!("multipart: failed to close {}: {}", path.display(), e);
                }

                match self.factory.delete(&path) {
                    Ok(()) => debug!("multipart: removed partial upload {}", path.display()),
                    Err(e) => log::warn!("failed to remove {}: {}", path.display(), e),
                }
            }
        }

        self.buf.release();
        self.state = MultipartState::Aborted;
    }

    fn feed_inner<S: FormFieldSink>(
        &mut self,
        chunk: &[u8],
        sink: &mut S,
    ) -> Result<ParseOutcome, Error> {
        self.body_size += chunk.len() as u64;

        if self.body_size > self.limits.max_body {
            return Err(Error::BodyTooLarge);
        }

        let mut src = chunk;

        loop {
            let size = self.buf.append(src);
            src = &src[size..];

            if self.process(sink)? == ParseOutcome::Complete {
                return Ok(ParseOutcome::Complete);
            }

            if src.is_empty() {
                return Ok(ParseOutcome::NeedMoreData);
            }

            // no progress possible without more room
            if self.buf.is_full() {
                return Err(Error::BodyTooLarge);
            }
        }
    }

    fn process<S: FormFieldSink>(&mut self, sink: &mut S) -> Result<ParseOutcome, Error> {
        loop {
            let progressed = match self.state {
                MultipartState::AwaitingBoundary => self.process_boundary()?,
                MultipartState::AwaitingPartHeader => self.process_header()?,
                MultipartState::ReceivingPartData => self.process_data(sink)?,
                MultipartState::Complete => {
                    self.buf.release();

                    sink.complete(&self.files);

                    return Ok(ParseOutcome::Complete);
                }
                MultipartState::Aborted => return Err(Error::Aborted),
            };

            if !progressed {
                return Ok(ParseOutcome::NeedMoreData);
            }
        }
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let buf = self.buf.read_buf();
        let pos = find_byte(buf, b'\n')?;
        let line = trim_line_end(&buf[..pos]).to_vec();

        self.buf.read_commit(pos + 1);

        Some(line)
    }

    fn process_boundary(&mut self) -> Result<bool, Error> {
        let dlen = self.delimiter.len();

        {
            let buf = self.buf.read_buf();

            // fail as soon as the input can't be a delimiter
            let cmp_len = cmp::min(buf.len(), dlen);
            if buf[..cmp_len] != self.delimiter[..cmp_len] {
                return Err(Error::MalformedBoundary);
            }

            if buf.len() < dlen + 2 {
                return Ok(false);
            }

            if &buf[dlen..(dlen + 2)] == b"--" {
                debug!("multipart: closing boundary");

                let size = buf.len();
                self.buf.read_commit(size);
                self.state = MultipartState::Complete;

                return Ok(true);
            }
        }

        let line = match self.next_line() {
            Some(line) => line,
            None => return Ok(false),
        };

        if !trim_padding(&line[dlen..]).is_empty() {
            return Err(Error::MalformedBoundary);
        }

        self.part = Some(PartDescriptor::new());
        self.state = MultipartState::AwaitingPartHeader;

        Ok(true)
    }

    fn process_header(&mut self) -> Result<bool, Error> {
        let line = match self.next_line() {
            Some(line) => line,
            None => return Ok(false),
        };

        if line.is_empty() {
            self.begin_data()?;

            return Ok(true);
        }

        let part = match self.part.as_mut() {
            Some(part) => part,
            None => return Err(Error::Aborted),
        };

        let pos = match find_byte(&line, b':') {
            Some(pos) => pos,
            None => return Err(Error::MalformedPartHeader),
        };

        let name = String::from_utf8_lossy(&line[..pos]);
        let name = name.trim();
        let value = String::from_utf8_lossy(&line[(pos + 1)..]);
        let value = value.trim();

        if name.eq_ignore_ascii_case("Content-Disposition") {
            part.apply_disposition(value)?;
        } else if name.eq_ignore_ascii_case("Content-Type") {
            // only recorded for file parts
            if part.file_name.is_some() {
                part.content_type = Some(value.to_string());
            }
        } else {
            debug!("multipart: ignoring part header {}", trim_for_display(name, 64));
        }

        Ok(true)
    }

    fn begin_data(&mut self) -> Result<(), Error> {
        let part = match self.part.as_mut() {
            Some(part) => part,
            None => return Err(Error::Aborted),
        };

        let name = match &part.field_name {
            Some(name) => name,
            None => return Err(Error::MissingNameField),
        };

        if part.file_name.is_some() {
            let (file, path) = self.factory.create()?;

            debug!(
                "multipart: receiving file for {} into {}",
                trim_for_display(name, 64),
                path.display()
            );

            part.sink = PartSink::File { file, path };
        } else {
            debug!("multipart: receiving field {}", trim_for_display(name, 64));

            part.sink = PartSink::Value(Vec::new());
        }

        self.state = MultipartState::ReceivingPartData;

        Ok(())
    }

    fn process_data<S: FormFieldSink>(&mut self, sink: &mut S) -> Result<bool, Error> {
        let buf = self.buf.read_buf();

        if let Some(pos) = find(buf, &self.data_end) {
            // the line break before the delimiter is not part of the data
            let mut end = pos;
            if end > 0 && buf[end - 1] == b'\r' {
                end -= 1;
            }

            if let Some(part) = self.part.as_mut() {
                part.write(&buf[..end], &self.limits)?;
            }

            // leave the delimiter line for process_boundary
            self.buf.read_commit(pos + 1);

            self.finish_part(sink)?;
            self.state = MultipartState::AwaitingBoundary;

            return Ok(true);
        }

        // hold back enough to complete a delimiter (and the carriage return
        // preceding it) that may be split across chunks
        let keep = self.data_end.len();

        if buf.len() > keep {
            let size = buf.len() - keep;

            if let Some(part) = self.part.as_mut() {
                part.write(&buf[..size], &self.limits)?;
            }

            self.buf.read_commit(size);
        }

        Ok(false)
    }

    fn finish_part<S: FormFieldSink>(&mut self, sink: &mut S) -> Result<(), Error> {
        let part = match self.part.take() {
            Some(part) => part,
            None => return Ok(()),
        };

        let name = part.field_name.unwrap_or_default();

        match part.sink {
            PartSink::Headers => {}
            PartSink::Value(value) => {
                debug!(
                    "multipart: field {} complete, {} bytes",
                    trim_for_display(&name, 64),
                    value.len()
                );

                sink.set_field(FormField { name, value });
            }
            PartSink::File { file, path } => {
                if let Err(e) = self.factory.close(file) {
                    if let Err(e) = self.factory.delete(&path) {
                        log::warn!("failed to remove {}: {}", path.display(), e);
                    }

                    return Err(Error::Storage(e));
                }

                let upload = FileUpload {
                    name,
                    client_file_name: part.file_name.unwrap_or_default(),
                    content_type: part.content_type,
                    size: part.bytes_written,
                    storage_path: path,
                };

                debug!(
                    "multipart: file {} complete, {} bytes in {}",
                    trim_for_display(&upload.name, 64),
                    upload.size,
                    upload.storage_path.display()
                );

                self.files.push(upload.clone());
                sink.add_file(upload);
            }
        }

        Ok(())
    }
}

/// Feeds everything from `reader` to `parser`, reading up to `read_size`
/// bytes at a time, until the closing boundary.
///
/// If reading fails or the input ends early, the parser is aborted. Files
/// completed before the failure remain listed in `parser.files()`.
pub fn decode<R, F, S>(
    parser: &mut MultipartParser<F>,
    reader: &mut R,
    sink: &mut S,
    read_size: usize,
) -> Result<(), Error>
where
    R: Read,
    F: TempFileFactory,
    S: FormFieldSink,
{
    let mut buf = vec![0; cmp::max(read_size, 1)];

    loop {
        let size = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(size) => size,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                parser.abort();

                return Err(Error::Read(e));
            }
        };

        if parser.feed(&buf[..size], sink)? == ParseOutcome::Complete {
            return Ok(());
        }
    }

    if parser.state() == MultipartState::Complete {
        return Ok(());
    }

    parser.abort();

    Err(Error::Truncated)
}

impl<F: TempFileFactory> Drop for MultipartParser<F> {
    fn drop(&mut self) {
        if self.part.is_some() {
            self.cleanup();
        }
    }
}
