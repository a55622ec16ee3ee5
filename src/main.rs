/*
 * Copyright (C) 2020-2022 Fanout, Inc.
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

use clap::Parser;
use httpgate::cgi::Completion;
use httpgate::cliargs::{CliArgs, Command};
use httpgate::core::config::Settings;
use httpgate::core::log::{self as simple_log, local_offset_check};
use httpgate::gateway::{CgiRequest, Gateway};
use httpgate::multipart::{self, boundary_from_content_type, MultipartParser};
use httpgate::response::Response;
use httpgate::upload::{remove_uploads, FileUpload, FormField, FormFieldSink, UploadDir};
use log::{debug, info, warn};
use serde_json::json;
use std::env;
use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

const READ_SIZE: usize = 16_384;

// writes one JSON object per line for each decoded record
struct JsonLines<W: Write> {
    out: W,
    error: Option<io::Error>,
}

impl<W: Write> JsonLines<W> {
    fn new(out: W) -> Self {
        Self { out, error: None }
    }

    fn emit(&mut self, v: serde_json::Value) {
        // keep the first error only
        if self.error.is_some() {
            return;
        }

        if let Err(e) = writeln!(self.out, "{}", v) {
            self.error = Some(e);
        }
    }
}

impl<W: Write> FormFieldSink for JsonLines<W> {
    fn set_field(&mut self, field: FormField) {
        self.emit(json!({
            "type": "field",
            "name": field.name,
            "value": String::from_utf8_lossy(&field.value),
        }));
    }

    fn add_file(&mut self, upload: FileUpload) {
        self.emit(json!({
            "type": "file",
            "file": upload,
        }));
    }

    fn complete(&mut self, files: &[FileUpload]) {
        self.emit(json!({
            "type": "complete",
            "files": files.len(),
        }));
    }
}

fn run_upload(
    settings: &Settings,
    content_type: Option<String>,
    boundary: Option<String>,
    upload_dir: Option<PathBuf>,
    discard: bool,
    input: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let boundary = match (boundary, content_type) {
        (Some(b), _) => b,
        (None, Some(ct)) => match boundary_from_content_type(&ct) {
            Some(b) => b,
            None => return Err(format!("no multipart boundary in content type: {}", ct).into()),
        },
        (None, None) => return Err("must specify content type or boundary".into()),
    };

    let factory = match upload_dir {
        Some(dir) => UploadDir::new(dir, &settings.upload.prefix),
        None => settings.upload_dir(),
    };

    debug!("storing uploads in {}", factory.dir().display());

    let mut parser = MultipartParser::new(boundary.as_bytes(), factory, settings.multipart_limits())?;

    let mut input: Box<dyn Read> = match &input {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(io::stdin()),
    };

    let stdout = io::stdout();
    let mut sink = JsonLines::new(stdout.lock());

    let ret: Result<(), Box<dyn Error>> =
        match multipart::decode(&mut parser, &mut input, &mut sink, READ_SIZE) {
            Ok(()) => match sink.error.take() {
                Some(e) => Err(e.into()),
                None => Ok(()),
            },
            Err(e) => Err(format!("{} (HTTP {})", e, e.status_code()).into()),
        };

    // stored files are only handed off on success
    if ret.is_err() || discard {
        remove_uploads(parser.files());
    }

    if ret.is_ok() {
        info!("decoded {} file(s)", parser.files().len());
    }

    ret
}

fn read_body(input: Option<PathBuf>) -> Result<Vec<u8>, io::Error> {
    match input {
        Some(path) if path == Path::new("-") => {
            let mut body = Vec::new();
            io::stdin().read_to_end(&mut body)?;

            Ok(body)
        }
        Some(path) => fs::read(path),
        None => Ok(Vec::new()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_cgi(
    settings: &Settings,
    script: PathBuf,
    method: String,
    script_name: Option<String>,
    path_info: String,
    query: String,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    input: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let gateway = Gateway::new(settings.gateway_config()?);

    let body = read_body(input)?;

    let script_name = match script_name {
        Some(s) => s,
        None => format!(
            "/{}",
            script
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        ),
    };

    let mut uri = format!("{}{}", script_name, path_info);
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }

    let request = CgiRequest {
        method,
        uri,
        script_name,
        path_info,
        query_string: query,
        headers,
        content_type,
        content_length: body.len() as u64,
        server_addr: settings.cgi.server_addr.clone(),
        server_name: settings.cgi.server_name.clone(),
        server_port: settings.cgi.server_port,
        ..Default::default()
    };

    let mut resp = Response::new();

    let ret = match gateway.run(&script, &request, &body, &mut resp) {
        Ok(Completion::Done) => Ok(()),
        Ok(Completion::InternalReRoute(path)) => {
            // there is nothing to dispatch to locally, so tell the client
            info!("{} rerouted request to {}", script.display(), path);

            resp.redirect(302, &path);

            Ok(())
        }
        Ok(Completion::ExternalRedirect { code, location }) => {
            resp.redirect(code, &location);

            Ok(())
        }
        Err(e) => {
            warn!("{}: {}", script.display(), e);

            resp = Response::new();
            resp.error(e.status_code(), "The CGI script failed.");

            Err(e)
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    resp.write_to(&mut out)?;
    out.flush()?;

    Ok(ret?)
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let log_file = match &args.log_file {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };

    simple_log::init(args.log_level, log_file)?;
    local_offset_check();

    let work_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let config_file = args.resolve_config_file(&work_dir)?;

    match &config_file {
        Some(f) => debug!("using config file {}", f.display()),
        None => debug!("no config file found, using defaults"),
    }

    let settings = Settings::new(config_file.as_deref())?;

    match args.command {
        Command::Upload {
            content_type,
            boundary,
            upload_dir,
            discard,
            input,
        } => run_upload(&settings, content_type, boundary, upload_dir, discard, input),
        Command::Cgi {
            script,
            method,
            script_name,
            path_info,
            query,
            headers,
            content_type,
            input,
        } => run_cgi(
            &settings,
            script,
            method,
            script_name,
            path_info,
            query,
            headers,
            content_type,
            input,
        ),
    }
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
