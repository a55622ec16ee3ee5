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

use log::{debug, warn};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::str;
use std::sync::atomic::{AtomicU64, Ordering};

// give up after this many name collisions in a row
const CREATE_ATTEMPTS_MAX: usize = 100;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// A plain (non-file) form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: Vec<u8>,
}

impl FormField {
    pub fn value_str(&self) -> Option<&str> {
        str::from_utf8(&self.value).ok()
    }
}

/// A completed file part, stored in a temporary file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileUpload {
    pub name: String,
    pub client_file_name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub storage_path: PathBuf,
}

/// Source of temporary files for file parts.
pub trait TempFileFactory {
    type File: Write;

    fn create(&mut self) -> Result<(Self::File, PathBuf), io::Error>;

    fn close(&mut self, file: Self::File) -> Result<(), io::Error>;

    fn delete(&mut self, path: &Path) -> Result<(), io::Error>;
}

/// Creates temporary files in a directory, with names unique across
/// processes and across parsers within a process.
pub struct UploadDir {
    dir: PathBuf,
    prefix: String,
}

impl UploadDir {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_path(&self) -> PathBuf {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);

        self.dir
            .join(format!("{}-{}-{}.tmp", self.prefix, process::id(), seq))
    }
}

impl TempFileFactory for UploadDir {
    type File = File;

    fn create(&mut self) -> Result<(File, PathBuf), io::Error> {
        for _ in 0..CREATE_ATTEMPTS_MAX {
            let path = self.next_path();

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => {
                    debug!("created upload file {}", path.display());

                    return Ok((f, path));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "unable to find unused upload file name",
        ))
    }

    fn close(&mut self, mut file: File) -> Result<(), io::Error> {
        file.flush()?;

        Ok(())
    }

    fn delete(&mut self, path: &Path) -> Result<(), io::Error> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Deletes the stored files of completed uploads, logging any failure.
pub fn remove_uploads(files: &[FileUpload]) {
    for f in files {
        match fs::remove_file(&f.storage_path) {
            Ok(()) => debug!("removed upload file {}", f.storage_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {}", f.storage_path.display(), e),
        }
    }
}

/// Receives the records decoded from a multipart body.
pub trait FormFieldSink {
    fn set_field(&mut self, field: FormField);

    fn add_file(&mut self, upload: FileUpload);

    // called once, after the closing boundary, with every completed file
    fn complete(&mut self, _files: &[FileUpload]) {}
}

#[derive(Debug, Default)]
pub struct FormData {
    pub fields: Vec<FormField>,
    pub files: Vec<FileUpload>,
    pub completed: bool,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn file(&self, name: &str) -> Option<&FileUpload> {
        self.files.iter().find(|f| f.name == name)
    }
}

impl FormFieldSink for FormData {
    fn set_field(&mut self, field: FormField) {
        self.fields.push(field);
    }

    fn add_file(&mut self, upload: FileUpload) {
        self.files.push(upload);
    }

    fn complete(&mut self, _files: &[FileUpload]) {
        self.completed = true;
    }
}
