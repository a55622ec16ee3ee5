/*
 * Copyright (C) 2023 Fastly, Inc.
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

use crate::cgi::HEADER_MAX_DEFAULT;
use crate::gateway::{GatewayConfig, READ_SIZE_DEFAULT};
use crate::multipart::{
    self, BODY_MAX_DEFAULT, BUFFER_MAX_DEFAULT, BUFFER_SIZE_DEFAULT, FIELD_MAX_DEFAULT,
    UPLOAD_MAX_DEFAULT,
};
use crate::upload::UploadDir;
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "httpgate.conf";

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub buffer_size: u64,
    pub max_buffer: u64,
    pub max_body: u64,
    pub max_upload_size: u64,
    pub max_field_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            buffer_size: BUFFER_SIZE_DEFAULT as u64,
            max_buffer: BUFFER_MAX_DEFAULT as u64,
            max_body: BODY_MAX_DEFAULT,
            max_upload_size: UPLOAD_MAX_DEFAULT,
            max_field_size: FIELD_MAX_DEFAULT,
        }
    }
}

impl From<Limits> for config::ValueKind {
    fn from(limits: Limits) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "buffer_size".to_string(),
            config::Value::from(limits.buffer_size as i64),
        );
        properties.insert(
            "max_buffer".to_string(),
            config::Value::from(limits.max_buffer as i64),
        );
        properties.insert(
            "max_body".to_string(),
            config::Value::from(limits.max_body as i64),
        );
        properties.insert(
            "max_upload_size".to_string(),
            config::Value::from(limits.max_upload_size as i64),
        );
        properties.insert(
            "max_field_size".to_string(),
            config::Value::from(limits.max_field_size as i64),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Upload {
    // empty means the system temp dir
    pub dir: String,
    pub prefix: String,
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            dir: String::new(),
            prefix: String::from("httpgate"),
        }
    }
}

impl From<Upload> for config::ValueKind {
    fn from(upload: Upload) -> Self {
        let mut properties = HashMap::new();
        properties.insert("dir".to_string(), config::Value::from(upload.dir));
        properties.insert("prefix".to_string(), config::Value::from(upload.prefix));

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Cgi {
    // comma-separated list of ext=program
    pub interpreters: String,
    pub nph_prefix: String,
    pub max_header: u64,
    pub read_size: u64,

    // empty means unset
    pub document_root: String,

    pub server_addr: String,
    pub server_name: String,
    pub server_port: u16,
}

impl Default for Cgi {
    fn default() -> Self {
        Self {
            interpreters: String::from("sh=/bin/sh,pl=/usr/bin/perl,py=/usr/bin/python3"),
            nph_prefix: String::from("nph-"),
            max_header: HEADER_MAX_DEFAULT as u64,
            read_size: READ_SIZE_DEFAULT as u64,
            document_root: String::new(),
            server_addr: String::from("127.0.0.1"),
            server_name: String::from("localhost"),
            server_port: 80,
        }
    }
}

impl From<Cgi> for config::ValueKind {
    fn from(cgi: Cgi) -> Self {
        let mut properties = HashMap::new();
        properties.insert(
            "interpreters".to_string(),
            config::Value::from(cgi.interpreters),
        );
        properties.insert("nph_prefix".to_string(), config::Value::from(cgi.nph_prefix));
        properties.insert(
            "max_header".to_string(),
            config::Value::from(cgi.max_header as i64),
        );
        properties.insert(
            "read_size".to_string(),
            config::Value::from(cgi.read_size as i64),
        );
        properties.insert(
            "document_root".to_string(),
            config::Value::from(cgi.document_root),
        );
        properties.insert(
            "server_addr".to_string(),
            config::Value::from(cgi.server_addr),
        );
        properties.insert(
            "server_name".to_string(),
            config::Value::from(cgi.server_name),
        );
        properties.insert(
            "server_port".to_string(),
            config::Value::from(cgi.server_port as i64),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    pub limits: Limits,
    pub upload: Upload,
    pub cgi: Cgi,
}

impl Settings {
    /// Loads settings from an INI file, falling back to defaults for
    /// anything not set. With no file, all defaults are used.
    pub fn new(config_file: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();

        if let Some(f) = config_file {
            builder = builder.add_source(File::from(f).format(FileFormat::Ini));
        }

        let config = builder
            .set_default("limits", Limits::default())?
            .set_default("upload", Upload::default())?
            .set_default("cgi", Cgi::default())?
            .build()?;

        let settings: Settings = config.try_deserialize()?;

        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.buffer_size > self.limits.max_buffer {
            return Err(ConfigError::Message(format!(
                "limits.buffer_size ({}) exceeds limits.max_buffer ({})",
                self.limits.buffer_size, self.limits.max_buffer
            )));
        }

        if self.cgi.read_size == 0 {
            return Err(ConfigError::Message(
                "cgi.read_size must be greater than zero".to_string(),
            ));
        }

        parse_interpreters(&self.cgi.interpreters)?;

        Ok(())
    }

    pub fn multipart_limits(&self) -> multipart::Limits {
        multipart::Limits {
            buffer_size: self.limits.buffer_size as usize,
            max_buffer: self.limits.max_buffer as usize,
            max_body: self.limits.max_body,
            max_upload_size: self.limits.max_upload_size,
            max_field_size: self.limits.max_field_size,
        }
    }

    pub fn upload_dir(&self) -> UploadDir {
        let dir = if self.upload.dir.is_empty() {
            env::temp_dir()
        } else {
            PathBuf::from(&self.upload.dir)
        };

        UploadDir::new(dir, &self.upload.prefix)
    }

    pub fn gateway_config(&self) -> Result<GatewayConfig, ConfigError> {
        Ok(GatewayConfig {
            interpreters: parse_interpreters(&self.cgi.interpreters)?,
            nph_prefix: self.cgi.nph_prefix.clone(),
            max_header: self.cgi.max_header as usize,
            read_size: self.cgi.read_size as usize,
            document_root: if self.cgi.document_root.is_empty() {
                None
            } else {
                Some(PathBuf::from(&self.cgi.document_root))
            },
        })
    }
}

// "sh=/bin/sh, pl=/usr/bin/perl"
pub fn parse_interpreters(s: &str) -> Result<HashMap<String, PathBuf>, ConfigError> {
    let mut out = HashMap::new();

    for item in s.split(',') {
        let item = item.trim();

        if item.is_empty() {
            continue;
        }

        let (ext, program) = match item.split_once('=') {
            Some((ext, program)) if !ext.trim().is_empty() && !program.trim().is_empty() => {
                (ext.trim(), program.trim())
            }
            _ => {
                return Err(ConfigError::Message(format!(
                    "invalid interpreter entry: {}",
                    item
                )))
            }
        };

        out.insert(
            ext.trim_start_matches('.').to_ascii_lowercase(),
            PathBuf::from(program),
        );
    }

    Ok(out)
}

pub fn get_config_file(
    work_dir: &Path,
    arg_config: Option<PathBuf>,
) -> Result<PathBuf, Box<dyn Error>> {
    let mut config_files: Vec<PathBuf> = vec![];
    match arg_config {
        Some(x) => config_files.push(x),
        None => {
            // ./config
            config_files.push(work_dir.join("config").join(CONFIG_FILE_NAME));
            // working dir
            config_files.push(work_dir.join(CONFIG_FILE_NAME));
        }
    }

    for cf in config_files.iter() {
        if cf.is_file() {
            return Ok(cf.clone());
        }
    }

    Err(format!(
        "no configuration file found. Tried: {}",
        config_files
            .iter()
            .map(|path_buf| path_buf.display().to_string())
            .collect::<Vec<String>>()
            .join(" ")
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults() {
        let settings = Settings::new(None).unwrap();

        assert_eq!(settings, Settings::default());

        let limits = settings.multipart_limits();
        assert_eq!(limits.buffer_size, BUFFER_SIZE_DEFAULT);
        assert_eq!(limits.max_body, BODY_MAX_DEFAULT);

        let gc = settings.gateway_config().unwrap();
        assert_eq!(gc.nph_prefix, "nph-");
        assert_eq!(gc.max_header, HEADER_MAX_DEFAULT);
        assert_eq!(gc.interpreters.get("sh"), Some(&PathBuf::from("/bin/sh")));
        assert_eq!(gc.document_root, None);
    }

    #[test]
    fn from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);

        fs::write(
            &path,
            "[limits]\n\
             max_body=1000\n\
             \n\
             [upload]\n\
             dir=/var/tmp/uploads\n\
             \n\
             [cgi]\n\
             interpreters=rb=/usr/bin/ruby\n\
             server_port=8080\n\
             document_root=/srv/www\n",
        )
        .unwrap();

        let settings = Settings::new(Some(&path)).unwrap();

        assert_eq!(settings.limits.max_body, 1000);
        assert_eq!(settings.limits.max_buffer, BUFFER_MAX_DEFAULT as u64);
        assert_eq!(settings.upload.prefix, "httpgate");
        assert_eq!(
            settings.upload_dir().dir(),
            Path::new("/var/tmp/uploads")
        );
        assert_eq!(settings.cgi.server_port, 8080);

        let gc = settings.gateway_config().unwrap();
        assert_eq!(gc.interpreters.len(), 1);
        assert_eq!(gc.document_root, Some(PathBuf::from("/srv/www")));
        assert_eq!(gc.interpreters.get("rb"), Some(&PathBuf::from("/usr/bin/ruby")));
    }

    #[test]
    fn invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);

        fs::write(&path, "[limits]\nbuffer_size=100\nmax_buffer=10\n").unwrap();
        assert!(Settings::new(Some(&path)).is_err());

        fs::write(&path, "[cgi]\ninterpreters=sh\n").unwrap();
        assert!(Settings::new(Some(&path)).is_err());
    }

    #[test]
    fn interpreters() {
        let m = parse_interpreters(" sh=/bin/sh, .PL=/usr/bin/perl ,").unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("pl"), Some(&PathBuf::from("/usr/bin/perl")));

        assert!(parse_interpreters("").unwrap().is_empty());
        assert!(parse_interpreters("sh=").is_err());
        assert!(parse_interpreters("=/bin/sh").is_err());
    }

    #[test]
    fn config_file_search() {
        let tmp = tempfile::tempdir().unwrap();

        assert!(get_config_file(tmp.path(), None).is_err());

        fs::write(tmp.path().join(CONFIG_FILE_NAME), "").unwrap();
        assert_eq!(
            get_config_file(tmp.path(), None).unwrap(),
            tmp.path().join(CONFIG_FILE_NAME)
        );

        fs::create_dir(tmp.path().join("config")).unwrap();
        fs::write(tmp.path().join("config").join(CONFIG_FILE_NAME), "").unwrap();
        assert_eq!(
            get_config_file(tmp.path(), None).unwrap(),
            tmp.path().join("config").join(CONFIG_FILE_NAME)
        );
    }

    #[test]
    fn config_file_explicit() {
        let tmp = tempfile::tempdir().unwrap();

        match get_config_file(tmp.path(), Some(PathBuf::from("no/such/file"))) {
            Ok(x) => panic!("lookup should fail, but returned {:?}", x),
            Err(e) => assert_eq!(
                e.to_string(),
                "no configuration file found. Tried: no/such/file"
            ),
        }
    }
}
