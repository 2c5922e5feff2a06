// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

use std::env;
use std::fs::File;
use std::sync::Once;

use simplelog::{Config, LevelFilter, SimpleLogger, WriteLogger};

const TRACE_VAR: &str = "P11CSP_TRACE";
const TRACE_LEVEL_VAR: &str = "P11CSP_TRACE_LEVEL";

static INIT: Once = Once::new();

#[derive(Debug, PartialEq)]
enum TraceTarget {
    Stdout,
    File(String),
}

impl TraceTarget {
    fn parse(value: &str) -> TraceTarget {
        match value {
            "stdout" => TraceTarget::Stdout,
            name => TraceTarget::File(name.to_string()),
        }
    }
}

/* unknown names select the most verbose level */
fn parse_level(value: Option<&str>) -> LevelFilter {
    match value {
        None => LevelFilter::Error,
        Some("off") => LevelFilter::Off,
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        Some(_) => LevelFilter::Trace,
    }
}

/// Sets up provider tracing, once per process.
///
/// P11CSP_TRACE selects the destination: `stdout`, or the name of a file
/// to write to. When unset no logger is installed. P11CSP_TRACE_LEVEL
/// selects one of off, error, warn, info, debug and trace, defaulting to
/// error. Failures (an unwritable file, another logger already
/// installed) leave tracing off without reporting anything.
pub fn p11csp_log_init() {
    INIT.call_once(|| {
        let target = match env::var(TRACE_VAR) {
            Ok(t) => TraceTarget::parse(&t),
            Err(_) => return,
        };
        let level = parse_level(env::var(TRACE_LEVEL_VAR).ok().as_deref());
        let _ = match target {
            TraceTarget::Stdout => SimpleLogger::init(level, Config::default()),
            TraceTarget::File(name) => match File::create(name) {
                Ok(file) => WriteLogger::init(level, Config::default(), file),
                Err(_) => return,
            },
        };
    });
}
