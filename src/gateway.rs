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

use crate::cgi::{self, CgiResponseParser, Completion, HEADER_MAX_DEFAULT};
use crate::core::buffer::trim_for_display;
use crate::core::version;
use crate::response::HttpResponseWriter;
use log::{debug, warn};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;

pub const READ_SIZE_DEFAULT: usize = 4096;

const STDERR_LINE_MAX: usize = 2048;

#[derive(Debug, Clone)]
pub struct CgiRequest {
    pub method: String,
    pub uri: String,
    pub protocol: String,
    pub script_name: String,
    pub path_info: String,
    pub query_string: String,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub auth_type: Option<String>,
    pub remote_user: Option<String>,
    pub remote_addr: String,

    // empty means use the gateway's configured root
    pub document_root: PathBuf,

    pub server_addr: String,
    pub server_name: String,
    pub server_port: u16,
}

impl Default for CgiRequest {
    fn default() -> Self {
        Self {
            method: String::from("GET"),
            uri: String::from("/"),
            protocol: String::from("HTTP/1.1"),
            script_name: String::new(),
            path_info: String::new(),
            query_string: String::new(),
            headers: Vec::new(),
            content_type: None,
            content_length: 0,
            auth_type: None,
            remote_user: None,
            remote_addr: String::from("127.0.0.1"),
            document_root: PathBuf::new(),
            server_addr: String::from("127.0.0.1"),
            server_name: String::from("localhost"),
            server_port: 80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInfo {
    pub path: PathBuf,

    // run the script through this program, else execute it directly
    pub interpreter: Option<PathBuf>,

    pub nph: bool,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // file extension (lowercase, no dot) to interpreter
    pub interpreters: HashMap<String, PathBuf>,
    pub nph_prefix: String,
    pub max_header: usize,
    pub read_size: usize,
    pub document_root: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            interpreters: HashMap::new(),
            nph_prefix: String::from("nph-"),
            max_header: HEADER_MAX_DEFAULT,
            read_size: READ_SIZE_DEFAULT,
            document_root: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("script not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to start {path}: {source}")]
    Spawn { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Cgi(#[from] cgi::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::Spawn { .. } => 503,
            GatewayError::Io(_) => 500,
            GatewayError::Cgi(e) => e.status_code(),
        }
    }
}

fn header_var_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 5);

    out.push_str("HTTP_");

    for c in name.chars() {
        if c == '-' {
            out.push('_');
        } else {
            out.push(c.to_ascii_uppercase());
        }
    }

    out
}

/// Builds the CGI/1.1 environment for running a script against a request.
pub fn cgi_environment(request: &CgiRequest, script: &ScriptInfo) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = vec![
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_PROTOCOL".into(), request.protocol.clone()),
        ("SERVER_SOFTWARE".into(), format!("httpgate/{}", version())),
        ("SERVER_NAME".into(), request.server_name.clone()),
        ("SERVER_PORT".into(), request.server_port.to_string()),
        ("REQUEST_METHOD".into(), request.method.clone()),
        ("REQUEST_URI".into(), request.uri.clone()),
        ("SERVER_ADDR".into(), request.server_addr.clone()),
        ("SERVER_HOST".into(), request.server_name.clone()),
        ("SERVER_URL".into(), request.server_name.clone()),
        (
            "DOCUMENT_ROOT".into(),
            request.document_root.to_string_lossy().into_owned(),
        ),
        ("REQUEST_TRANSPORT".into(), "http".into()),
        ("QUERY_STRING".into(), request.query_string.clone()),
        ("SCRIPT_NAME".into(), request.script_name.clone()),
        (
            "SCRIPT_FILENAME".into(),
            script.path.to_string_lossy().into_owned(),
        ),
        ("PATH_INFO".into(), request.path_info.clone()),
        ("CONTENT_LENGTH".into(), request.content_length.to_string()),
        ("REMOTE_ADDR".into(), request.remote_addr.clone()),
        ("REMOTE_HOST".into(), request.remote_addr.clone()),
        (
            "REMOTE_USER".into(),
            request.remote_user.clone().unwrap_or_default(),
        ),
        (
            "AUTH_TYPE".into(),
            request.auth_type.clone().unwrap_or_default(),
        ),
        ("REDIRECT_STATUS".into(), "200".into()),
    ];

    if let Some(ct) = &request.content_type {
        vars.push(("CONTENT_TYPE".into(), ct.clone()));
    }

    // never empty, since scripts may try to open it
    if !request.path_info.is_empty() && !request.document_root.as_os_str().is_empty() {
        let translated = request
            .document_root
            .join(request.path_info.trim_start_matches('/'));

        vars.push((
            "PATH_TRANSLATED".into(),
            translated.to_string_lossy().into_owned(),
        ));
    }

    let mut headers: Vec<(String, String)> = Vec::new();

    for (name, value) in request.headers.iter() {
        // already passed as CONTENT_TYPE and CONTENT_LENGTH
        if name.eq_ignore_ascii_case("Content-Type") || name.eq_ignore_ascii_case("Content-Length")
        {
            continue;
        }

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            continue;
        }

        let var = header_var_name(name);

        match headers.iter_mut().find(|(n, _)| *n == var) {
            Some((_, v)) => {
                v.push_str(", ");
                v.push_str(value);
            }
            None => headers.push((var, value.clone())),
        }
    }

    vars.extend(headers);

    vars
}

fn write_stdin(mut stdin: ChildStdin, body: &[u8]) {
    if body.is_empty() {
        return;
    }

    // the script may exit without reading its input
    if let Err(e) = stdin.write_all(body) {
        debug!("cgi: failed to write request body: {}", e);
    }
}

fn log_stderr(stderr: ChildStderr, name: &str) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();

        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let msg = String::from_utf8_lossy(&line);
                let msg = msg.trim_end();

                if !msg.is_empty() {
                    warn!("{}: {}", name, trim_for_display(msg, STDERR_LINE_MAX));
                }
            }
            Err(e) => {
                warn!("{}: failed to read from standard error: {}", name, e);
                break;
            }
        }
    }
}

/// Runs CGI scripts and decodes their output.
pub struct Gateway {
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn script_info(&self, script: &Path) -> ScriptInfo {
        let interpreter = script
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.config.interpreters.get(&ext.to_ascii_lowercase()))
            .cloned();

        let nph = !self.config.nph_prefix.is_empty()
            && script
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with(&self.config.nph_prefix));

        ScriptInfo {
            path: script.to_path_buf(),
            interpreter,
            nph,
        }
    }

    /// Executes `script` with `body` as its input and passes its output to
    /// `writer`.
    ///
    /// Returns how the response should be finished. On error, part of the
    /// response may already have been written.
    pub fn run<W: HttpResponseWriter>(
        &self,
        script: &Path,
        request: &CgiRequest,
        body: &[u8],
        writer: &mut W,
    ) -> Result<Completion, GatewayError> {
        if !script.is_file() {
            return Err(GatewayError::NotFound(script.to_path_buf()));
        }

        // the child runs in the script's directory, so a relative path would
        // no longer resolve
        let path = match fs::canonicalize(script) {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(script.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        // interpreter and NPH mode follow the name the script was invoked by
        let mut info = self.script_info(script);
        info.path = path;

        let mut command = match &info.interpreter {
            Some(program) => {
                let mut c = Command::new(program);
                c.arg(&info.path);
                c
            }
            None => Command::new(&info.path),
        };

        command.env_clear();

        if let Some(path) = env::var_os("PATH") {
            command.env("PATH", path);
        }

        let vars = match &self.config.document_root {
            Some(root) if request.document_root.as_os_str().is_empty() => {
                let mut request = request.clone();
                request.document_root = root.clone();

                cgi_environment(&request, &info)
            }
            _ => cgi_environment(request, &info),
        };

        command.envs(vars);

        if let Some(dir) = info.path.parent() {
            if !dir.as_os_str().is_empty() {
                command.current_dir(dir);
            }
        }

        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        debug!(
            "cgi: running {} (nph={})",
            info.path.display(),
            info.nph
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(GatewayError::Spawn {
                    path: script.to_path_buf(),
                    source: e,
                })
            }
        };

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();

                    return Err(io::Error::new(io::ErrorKind::Other, "child pipes missing").into());
                }
            };

        let mut parser = CgiResponseParser::new(info.nph, self.config.max_header);

        if info.nph {
            writer.set_persistent(false);
            writer.set_raw(true);
        }

        let name = script
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let stderr_name = name.as_str();

        let pumped = thread::scope(|s| {
            s.spawn(move || write_stdin(stdin, body));
            s.spawn(move || log_stderr(stderr, stderr_name));

            let ret = self.pump(stdout, &mut parser, writer);

            if ret.is_err() {
                // don't leave the script blocked on a full pipe
                if let Err(e) = child.kill() {
                    debug!("cgi: failed to kill {}: {}", name, e);
                }
            }

            ret
        });

        let status = child.wait()?;

        if let Err(e) = pumped {
            parser.abort();

            return Err(e);
        }

        // killed by signal
        let exit_code = status.code().unwrap_or(-1);

        debug!(
            "cgi: {} exited with code {}, body size {}",
            name,
            exit_code,
            parser.body_size()
        );

        Ok(parser.finish(exit_code)?)
    }

    fn pump<W: HttpResponseWriter>(
        &self,
        mut stdout: ChildStdout,
        parser: &mut CgiResponseParser,
        writer: &mut W,
    ) -> Result<(), GatewayError> {
        let mut buf = vec![0; self.config.read_size];

        loop {
            let size = match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(size) => size,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            parser.feed(&buf[..size], writer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CgiRequest {
        CgiRequest {
            method: "POST".to_string(),
            uri: "/cgi-bin/test.sh/extra?a=1".to_string(),
            script_name: "/cgi-bin/test.sh".to_string(),
            path_info: "/extra".to_string(),
            query_string: "a=1".to_string(),
            headers: vec![
                ("User-Agent".to_string(), "curl/8.0".to_string()),
                ("X-Multi".to_string(), "a".to_string()),
                ("x-multi".to_string(), "b".to_string()),
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Bad Header".to_string(), "x".to_string()),
            ],
            content_type: Some("text/plain".to_string()),
            content_length: 5,
            document_root: PathBuf::from("/srv/www"),
            server_addr: "10.0.0.1".to_string(),
            server_name: "example.com".to_string(),
            ..Default::default()
        }
    }

    fn var<'a>(vars: &'a [(String, String)], name: &str) -> Option<&'a str> {
        vars.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn environment() {
        let script = ScriptInfo {
            path: PathBuf::from("/srv/cgi-bin/test.sh"),
            interpreter: None,
            nph: false,
        };

        let vars = cgi_environment(&request(), &script);

        assert_eq!(var(&vars, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(var(&vars, "SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(var(&vars, "REQUEST_METHOD"), Some("POST"));
        assert_eq!(var(&vars, "QUERY_STRING"), Some("a=1"));
        assert_eq!(var(&vars, "SCRIPT_NAME"), Some("/cgi-bin/test.sh"));
        assert_eq!(var(&vars, "SCRIPT_FILENAME"), Some("/srv/cgi-bin/test.sh"));
        assert_eq!(var(&vars, "PATH_INFO"), Some("/extra"));
        assert_eq!(var(&vars, "CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(var(&vars, "CONTENT_LENGTH"), Some("5"));
        assert_eq!(var(&vars, "SERVER_PORT"), Some("80"));
        assert_eq!(var(&vars, "SERVER_ADDR"), Some("10.0.0.1"));
        assert_eq!(var(&vars, "SERVER_NAME"), Some("example.com"));
        assert_eq!(var(&vars, "SERVER_HOST"), Some("example.com"));
        assert_eq!(var(&vars, "SERVER_URL"), Some("example.com"));
        assert_eq!(var(&vars, "DOCUMENT_ROOT"), Some("/srv/www"));
        assert_eq!(var(&vars, "PATH_TRANSLATED"), Some("/srv/www/extra"));
        assert_eq!(var(&vars, "AUTH_TYPE"), Some(""));
        assert_eq!(var(&vars, "REMOTE_USER"), Some(""));
        assert_eq!(var(&vars, "REDIRECT_STATUS"), Some("200"));
        assert_eq!(var(&vars, "HTTP_USER_AGENT"), Some("curl/8.0"));
        assert_eq!(var(&vars, "HTTP_X_MULTI"), Some("a, b"));
        assert!(var(&vars, "HTTP_CONTENT_TYPE").is_none());
        assert!(vars.iter().all(|(n, _)| !n.contains(' ')));
        assert!(var(&vars, "SERVER_SOFTWARE")
            .unwrap()
            .starts_with("httpgate/"));
    }

    #[test]
    fn environment_auth_and_no_path_info() {
        let script = ScriptInfo {
            path: PathBuf::from("/srv/cgi-bin/test.sh"),
            interpreter: None,
            nph: false,
        };

        let req = CgiRequest {
            auth_type: Some("Basic".to_string()),
            remote_user: Some("alice".to_string()),
            document_root: PathBuf::from("/srv/www"),
            ..Default::default()
        };

        let vars = cgi_environment(&req, &script);

        assert_eq!(var(&vars, "AUTH_TYPE"), Some("Basic"));
        assert_eq!(var(&vars, "REMOTE_USER"), Some("alice"));
        assert!(var(&vars, "PATH_TRANSLATED").is_none());

        // no document root, so nothing to translate against
        let req = CgiRequest {
            path_info: "/extra".to_string(),
            ..Default::default()
        };

        let vars = cgi_environment(&req, &script);
        assert_eq!(var(&vars, "DOCUMENT_ROOT"), Some(""));
        assert!(var(&vars, "PATH_TRANSLATED").is_none());
    }

    #[test]
    fn script_info() {
        let mut config = GatewayConfig::default();
        config
            .interpreters
            .insert("sh".to_string(), PathBuf::from("/bin/sh"));

        let gw = Gateway::new(config);

        let info = gw.script_info(Path::new("/srv/cgi-bin/test.SH"));
        assert_eq!(info.interpreter, Some(PathBuf::from("/bin/sh")));
        assert!(!info.nph);

        let info = gw.script_info(Path::new("/srv/cgi-bin/nph-test"));
        assert_eq!(info.interpreter, None);
        assert!(info.nph);

        // prefix applies to the file name only
        let info = gw.script_info(Path::new("/srv/nph-bin/test"));
        assert!(!info.nph);
    }

    #[test]
    fn error_status() {
        assert_eq!(GatewayError::NotFound(PathBuf::from("x")).status_code(), 404);
        assert_eq!(
            GatewayError::Spawn {
                path: PathBuf::from("x"),
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            }
            .status_code(),
            503
        );
        assert_eq!(
            GatewayError::Cgi(cgi::Error::BufferOverflow).status_code(),
            504
        );
        assert_eq!(
            GatewayError::Cgi(cgi::Error::GatewayProcessFailed(1)).status_code(),
            503
        );
    }

    #[test]
    fn missing_script() {
        let gw = Gateway::new(GatewayConfig::default());
        let mut resp = crate::response::Response::new();

        let ret = gw.run(
            Path::new("/no/such/script.sh"),
            &CgiRequest::default(),
            b"",
            &mut resp,
        );

        assert!(matches!(ret, Err(GatewayError::NotFound(_))));
    }
}
