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

use crate::core::config::get_config_file;
use crate::core::version;
use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};

// Struct to hold the command line arguments
#[derive(Parser, Debug)]
#[command(
    name = "httpgate",
    version = version(),
    about = "Decode multipart uploads and run CGI scripts."
)]
pub struct CliArgs {
    /// Set path to the configuration file
    #[arg(short, long, value_name = "file", global = true)]
    pub config_file: Option<String>,

    /// Set path to the log file
    #[arg(short = 'l', long, value_name = "file", global = true)]
    pub log_file: Option<String>,

    /// Set log level (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(short = 'L', long, value_name = "x", default_value_t = 2, value_parser = clap::value_parser!(u32).range(0..=4), global = true)]
    pub log_level: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode a multipart/form-data body, storing file parts in the upload
    /// directory and printing one JSON record per part
    Upload {
        /// Content-Type of the body, including the boundary parameter
        #[arg(short = 't', long, value_name = "type", required_unless_present = "boundary")]
        content_type: Option<String>,

        /// Boundary of the body, instead of a Content-Type
        #[arg(short, long, value_name = "boundary", conflicts_with = "content_type")]
        boundary: Option<String>,

        /// Override the upload directory
        #[arg(short = 'd', long, value_name = "dir")]
        upload_dir: Option<PathBuf>,

        /// Remove stored files after printing the records
        #[arg(long, default_value_t = false)]
        discard: bool,

        /// Read the body from a file instead of standard input
        #[arg(value_name = "file")]
        input: Option<PathBuf>,
    },

    /// Run a CGI script and print the HTTP response it produces
    Cgi {
        /// Script to run
        #[arg(value_name = "script")]
        script: PathBuf,

        /// Request method
        #[arg(short = 'm', long, value_name = "method", default_value = "GET")]
        method: String,

        /// Request URI path of the script
        #[arg(long, value_name = "path")]
        script_name: Option<String>,

        /// Extra path after the script name
        #[arg(long, value_name = "path", default_value = "")]
        path_info: String,

        /// Query string, without the leading '?'
        #[arg(short = 'q', long, value_name = "query", default_value = "")]
        query: String,

        /// Add a request header
        #[arg(short = 'H', long = "header", value_name = "name: value", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Content-Type of the request body
        #[arg(short = 't', long, value_name = "type")]
        content_type: Option<String>,

        /// Read the request body from a file ("-" for standard input)
        #[arg(short = 'i', long, value_name = "file")]
        input: Option<PathBuf>,
    },
}

pub fn parse_header(s: &str) -> Result<(String, String), String> {
    let pos = match s.find(':') {
        Some(pos) => pos,
        None => return Err(format!("header must be of the form \"name: value\": {}", s)),
    };

    let name = s[..pos].trim();
    if name.is_empty() {
        return Err(format!("header name is empty: {}", s));
    }

    Ok((name.to_string(), s[(pos + 1)..].trim().to_string()))
}

impl CliArgs {
    /// Locates the configuration file. A file given on the command line must
    /// exist. Otherwise the standard locations are searched, and if nothing
    /// is found then defaults are used.
    pub fn resolve_config_file(&self, work_dir: &Path) -> Result<Option<PathBuf>, Box<dyn Error>> {
        match &self.config_file {
            Some(f) => Ok(Some(get_config_file(work_dir, Some(PathBuf::from(f)))?)),
            None => Ok(get_config_file(work_dir, None).ok()),
        }
    }
}
