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

use httpgate::core::config::Settings;
use httpgate::multipart::{
    self, boundary_from_content_type, Error, MultipartParser, MultipartState,
};
use httpgate::upload::{remove_uploads, FormData, UploadDir};
use httpgate::ParseOutcome;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use test_log::test;

const CONTENT_TYPE: &str = "multipart/form-data; boundary=\"----WebKitFormBoundary7MA4YWxkTrZu0gW\"";

fn body(file: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(
        b"------WebKitFormBoundary7MA4YWxkTrZu0gW\r\n\
          Content-Disposition: form-data; name=\"title\"\r\n\
          \r\n\
          holiday\r\n\
          ------WebKitFormBoundary7MA4YWxkTrZu0gW\r\n\
          Content-Disposition: form-data; name=\"photo\"; filename=\"beach.jpg\"\r\n\
          Content-Type: image/jpeg\r\n\
          \r\n",
    );
    out.extend_from_slice(file);
    out.extend_from_slice(b"\r\n------WebKitFormBoundary7MA4YWxkTrZu0gW--\r\n");

    out
}

fn file_data() -> Vec<u8> {
    // binary data with line breaks and near-miss delimiters
    let mut data = Vec::new();

    for i in 0..5000u32 {
        data.push((i % 251) as u8);

        if i % 97 == 0 {
            data.extend_from_slice(b"\r\n------WebKitFormBoundary");
        }
    }

    data
}

fn dir_count(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

#[test]
fn upload_to_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let boundary = boundary_from_content_type(CONTENT_TYPE).unwrap();
    let file = file_data();
    let body = body(&file);

    for chunk_size in [1, 3, 64, 1000, body.len()] {
        let settings = Settings::default();

        let mut p = MultipartParser::new(
            boundary.as_bytes(),
            UploadDir::new(tmp.path(), "it"),
            settings.multipart_limits(),
        )
        .unwrap();

        let mut data = FormData::new();
        let mut ret = ParseOutcome::NeedMoreData;

        for chunk in body.chunks(chunk_size) {
            ret = p.feed(chunk, &mut data).unwrap();
        }

        assert_eq!(ret, ParseOutcome::Complete, "chunk size {}", chunk_size);
        assert_eq!(p.state(), MultipartState::Complete);
        assert!(data.completed);

        assert_eq!(data.field("title").unwrap().value_str(), Some("holiday"));

        let upload = data.file("photo").unwrap();
        assert_eq!(upload.client_file_name, "beach.jpg");
        assert_eq!(upload.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(upload.size, file.len() as u64);
        assert_eq!(fs::read(&upload.storage_path).unwrap(), file);

        fs::remove_file(&upload.storage_path).unwrap();
    }

    assert_eq!(dir_count(tmp.path()), 0);
}

#[test]
fn truncated_body_cleanup() {
    let tmp = tempfile::tempdir().unwrap();
    let boundary = boundary_from_content_type(CONTENT_TYPE).unwrap();
    let body = body(&file_data());

    {
        let mut p = MultipartParser::new(
            boundary.as_bytes(),
            UploadDir::new(tmp.path(), "it"),
            Default::default(),
        )
        .unwrap();

        let mut data = FormData::new();

        let ret = p.feed(&body[..(body.len() / 2)], &mut data).unwrap();
        assert_eq!(ret, ParseOutcome::NeedMoreData);
        assert_eq!(p.state(), MultipartState::ReceivingPartData);
        assert_eq!(dir_count(tmp.path()), 1);

        // dropped mid-file
    }

    assert_eq!(dir_count(tmp.path()), 0);
}

#[test]
fn upload_too_large() {
    let tmp = tempfile::tempdir().unwrap();
    let boundary = boundary_from_content_type(CONTENT_TYPE).unwrap();
    let body = body(&file_data());

    let mut limits = Settings::default().multipart_limits();
    limits.max_upload_size = 1000;

    let mut p = MultipartParser::new(boundary.as_bytes(), UploadDir::new(tmp.path(), "it"), limits)
        .unwrap();

    let mut data = FormData::new();

    let mut err = None;
    for chunk in body.chunks(512) {
        if let Err(e) = p.feed(chunk, &mut data) {
            err = Some(e);
            break;
        }
    }

    let e = err.unwrap();
    assert!(matches!(e, Error::BodyTooLarge));
    assert_eq!(e.status_code(), 400);
    assert!(data.files.is_empty());
    assert_eq!(dir_count(tmp.path()), 0);

    assert!(matches!(p.feed(b"x", &mut data), Err(Error::Aborted)));
}

// yields the data, then fails
struct FailingReader {
    data: io::Cursor<Vec<u8>>,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.read(buf)? {
            0 => Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            size => Ok(size),
        }
    }
}

#[test]
fn decode_from_reader() {
    let tmp = tempfile::tempdir().unwrap();
    let boundary = boundary_from_content_type(CONTENT_TYPE).unwrap();
    let file = file_data();
    let body = body(&file);

    let mut p = MultipartParser::new(
        boundary.as_bytes(),
        UploadDir::new(tmp.path(), "it"),
        Default::default(),
    )
    .unwrap();

    let mut data = FormData::new();

    multipart::decode(&mut p, &mut body.as_slice(), &mut data, 100).unwrap();

    assert!(data.completed);
    assert_eq!(p.files().len(), 1);
    assert_eq!(fs::read(&p.files()[0].storage_path).unwrap(), file);

    remove_uploads(p.files());
    assert_eq!(dir_count(tmp.path()), 0);
}

#[test]
fn decode_truncated_after_file() {
    let tmp = tempfile::tempdir().unwrap();
    let boundary = boundary_from_content_type(CONTENT_TYPE).unwrap();

    // the file part is complete, but the body stops inside the next part
    let mut body = body(b"first");
    body.truncate(body.len() - b"--\r\n".len());
    body.extend_from_slice(
        b"\r\nContent-Disposition: form-data; name=\"more\"; filename=\"b.txt\"\r\n\r\npartial",
    );

    let mut p = MultipartParser::new(
        boundary.as_bytes(),
        UploadDir::new(tmp.path(), "it"),
        Default::default(),
    )
    .unwrap();

    let mut data = FormData::new();

    let e = multipart::decode(&mut p, &mut body.as_slice(), &mut data, 16).unwrap_err();
    assert!(matches!(e, Error::Truncated));
    assert_eq!(e.status_code(), 400);
    assert_eq!(p.state(), MultipartState::Aborted);
    assert!(!data.completed);

    // the partial file is gone, the completed one is left to the caller
    assert_eq!(p.files().len(), 1);
    assert_eq!(data.file("photo").unwrap().storage_path, p.files()[0].storage_path);
    assert_eq!(dir_count(tmp.path()), 1);

    remove_uploads(p.files());
    assert_eq!(dir_count(tmp.path()), 0);
}

#[test]
fn decode_read_error() {
    let tmp = tempfile::tempdir().unwrap();
    let boundary = boundary_from_content_type(CONTENT_TYPE).unwrap();
    let body = body(&file_data());

    let mut p = MultipartParser::new(
        boundary.as_bytes(),
        UploadDir::new(tmp.path(), "it"),
        Default::default(),
    )
    .unwrap();

    let mut data = FormData::new();

    let mut reader = FailingReader {
        data: io::Cursor::new(body[..(body.len() / 2)].to_vec()),
    };

    let e = multipart::decode(&mut p, &mut reader, &mut data, 256).unwrap_err();
    assert!(matches!(e, Error::Read(_)));
    assert_eq!(e.status_code(), 400);
    assert_eq!(p.state(), MultipartState::Aborted);

    // no file part finished, and the partial one was removed
    assert!(p.files().is_empty());
    assert_eq!(dir_count(tmp.path()), 0);
}
