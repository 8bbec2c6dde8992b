//! Logging setup.
//!
//! Events are rendered as `YYYY-MM-DD HH:MM:SS [name       ] [L] message`
//! where `name` is the component id carried in the event's `name` field
//! and `L` is the one-letter level, one of `T,D,I,W,E,C`. Components log
//! with `tracing::info!(name = %self.id, "...")`. There is no sixth
//! tracing level above ERROR; a critical event is an ERROR-level event
//! marked `critical = true`, rendered as `[C]` in bold red.

use std::fmt::{self, Write as _};

use chrono::Local;
use tracing::{Event, Level, Subscriber, field::Visit, metadata::LevelFilter};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    prelude::*,
    registry::LookupSpan,
};

/// Logging options derived from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub ansi: bool,
    pub debug: bool,
    pub trace: bool,
}

struct EventFormat {
    ansi: bool,
}

struct FieldCollector {
    name: Option<String>,
    message: String,
    critical: bool,
    rest: String,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "name" => self.name = Some(format!("{value:?}")),
            "critical" => self.critical = format!("{value:?}") == "true",
            other => {
                self.rest.push_str(&format!(" {other}={value:?}"));
            }
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "name" => self.name = Some(value.to_string()),
            other => {
                self.rest.push_str(&format!(" {other}={value}"));
            }
        }
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        if field.name() == "critical" {
            self.critical = value;
        } else {
            self.rest.push_str(&format!(" {}={value}", field.name()));
        }
    }
}

const fn level_char(level: Level, critical: bool) -> char {
    match level {
        Level::TRACE => 'T',
        Level::DEBUG => 'D',
        Level::INFO => 'I',
        Level::WARN => 'W',
        Level::ERROR => {
            if critical {
                'C'
            } else {
                'E'
            }
        }
    }
}

const fn level_color(level: Level, critical: bool) -> &'static str {
    match level {
        Level::WARN => "\x1b[33;20m",
        Level::ERROR => {
            if critical {
                "\x1b[31;1m"
            } else {
                "\x1b[31;20m"
            }
        }
        _ => "\x1b[38;20m",
    }
}

impl<S, N> FormatEvent<S, N> for EventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = FieldCollector {
            name: None,
            message: String::new(),
            critical: false,
            rest: String::new(),
        };
        event.record(&mut fields);

        let level = *event.metadata().level();
        let name = fields.name.unwrap_or_else(|| "main".to_string());

        write!(
            writer,
            "{} [{:<10.10}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            name
        )?;
        if self.ansi {
            write!(writer, "{}", level_color(level, fields.critical))?;
        }
        write!(
            writer,
            "[{}] {}{}",
            level_char(level, fields.critical),
            fields.message,
            fields.rest
        )?;
        if self.ansi {
            write!(writer, "\x1b[0m")?;
        }
        writeln!(writer)
    }
}

/// Initializes the global subscriber. `RUST_LOG` takes precedence over
/// the level flags when set.
pub fn init(options: &Options) {
    let level = if options.trace {
        LevelFilter::TRACE
    } else if options.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let format = EventFormat { ansi: options.ansi };
    let layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_filter(filter);

    // a second init (tests, embedders) is not an error worth surfacing
    let _ = tracing_subscriber::registry().with(layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_their_letters() {
        assert_eq!(level_char(Level::TRACE, false), 'T');
        assert_eq!(level_char(Level::DEBUG, false), 'D');
        assert_eq!(level_char(Level::INFO, false), 'I');
        assert_eq!(level_char(Level::WARN, false), 'W');
        assert_eq!(level_char(Level::ERROR, false), 'E');
        // critical rides on ERROR with its own letter
        assert_eq!(level_char(Level::ERROR, true), 'C');
        // the marker changes nothing below ERROR
        assert_eq!(level_char(Level::INFO, true), 'I');
    }

    #[test]
    fn critical_gets_the_bold_color() {
        assert_ne!(
            level_color(Level::ERROR, true),
            level_color(Level::ERROR, false)
        );
    }
}

