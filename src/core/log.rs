/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::File;
use std::io::{self, Write};
use std::str;
use std::sync::{Mutex, OnceLock};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

// stdout carries command output, so logs go to stderr
enum SharedOutput<'a> {
    Stderr(io::Stderr),
    File(&'a Mutex<File>),
}

impl Write for SharedOutput<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Stderr(g) => g.write(buf),
            Self::File(g) => (*g).lock().unwrap().write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match self {
            Self::Stderr(g) => g.flush(),
            Self::File(g) => (*g).lock().unwrap().flush(),
        }
    }
}

pub struct SimpleLogger {
    local_offset: Option<UtcOffset>,
    output_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    fn write_record<W: Write>(&self, output: &mut W, record: &Record) -> Result<(), io::Error> {
        let now = OffsetDateTime::now_utc().to_offset(self.local_offset.unwrap_or(UtcOffset::UTC));

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            now.format_into(&mut ts, &format)
                .expect("failed to write timestamp");

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size]).expect("timestamp is not utf-8");

        let lname = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        if record.level() <= log::Level::Info {
            writeln!(output, "[{}] {} {}", lname, ts, record.args())
        } else {
            writeln!(
                output,
                "[{}] {} [{}] {}",
                lname,
                ts,
                record.target(),
                record.args()
            )
        }
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut output = match &self.output_file {
            Some(f) => SharedOutput::File(f),
            None => SharedOutput::Stderr(io::stderr()),
        };

        self.write_record(&mut output, record)
            .expect("failed to write log output");
    }

    fn flush(&self) {}
}

// SAFETY: this method is unsound on platforms where another thread may
// modify environment vars
unsafe fn get_offset() -> Option<UtcOffset> {
    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound);

    let offset = UtcOffset::current_local_offset().ok();

    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Sound);

    offset
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

pub fn ensure_init_simple_logger(output_file: Option<File>) {
    LOGGER.get_or_init(|| {
        // SAFETY: we accept that this call is unsound. on some platforms it
        // is the only way to know the time zone, with a chance of UB if
        // another thread modifies environment vars during the call. the risk
        // is low, as this call will happen very early in the program, and
        // only once
        let local_offset = unsafe { get_offset() };

        SimpleLogger {
            local_offset,
            output_file: output_file.map(Mutex::new),
        }
    });
}

pub fn get_simple_logger() -> &'static SimpleLogger {
    ensure_init_simple_logger(None);

    // logger is guaranteed to have been initialized
    LOGGER.get().expect("logger should be initialized")
}

pub fn local_offset_check() {
    if get_simple_logger().local_offset.is_none() {
        log::warn!("Failed to determine local time offset. Log timestamps will be in UTC.");
    }
}

// 0=error, 1=warn, 2=info, 3=debug, 4=trace
pub fn level_filter(level: u32) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn init(level: u32, output_file: Option<File>) -> Result<(), SetLoggerError> {
    ensure_init_simple_logger(output_file);

    log::set_logger(get_simple_logger())?;
    log::set_max_level(level_filter(level));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn record_line(level: Level, msg: &str) -> String {
        let logger = SimpleLogger {
            local_offset: None,
            output_file: None,
        };

        let mut out = Vec::new();

        logger
            .write_record(
                &mut out,
                &Record::builder()
                    .level(level)
                    .target("httpgate::cgi")
                    .args(format_args!("{}", msg))
                    .build(),
            )
            .unwrap();

        String::from_utf8(out).unwrap()
    }

    #[test]
    fn record_format() {
        let line = record_line(Level::Info, "started");
        assert!(line.starts_with("[INFO] "));
        assert!(line.ends_with(" started\n"));
        assert!(!line.contains("httpgate::cgi"));

        let line = record_line(Level::Debug, "headers complete");
        assert!(line.starts_with("[DEBUG] "));
        assert!(line.ends_with(" [httpgate::cgi] headers complete\n"));

        // timestamp with milliseconds
        let ts = &line["[DEBUG] ".len()..("[DEBUG] ".len() + 23)];
        assert_eq!(ts.as_bytes()[4], b'-');
        assert_eq!(ts.as_bytes()[10], b' ');
        assert_eq!(ts.as_bytes()[19], b'.');
    }

    #[test]
    fn levels() {
        assert_eq!(level_filter(0), LevelFilter::Error);
        assert_eq!(level_filter(2), LevelFilter::Info);
        assert_eq!(level_filter(4), LevelFilter::Trace);
        assert_eq!(level_filter(9), LevelFilter::Trace);
    }
}
