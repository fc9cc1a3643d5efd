use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::FilterFn,
    fmt::{
        format::{FormatEvent, FormatFields, Writer},
        FmtContext,
    },
    prelude::__tracing_subscriber_SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    Layer,
};

use crate::config::LogLevel;

/// Event formatter producing `[level]: message` lines.
///
/// TRACE renders as `smtp` since that level is reserved for the full
/// client/server dialog.
struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        let label = if level == Level::ERROR {
            "error"
        } else if level == Level::WARN {
            "warn"
        } else if level == Level::INFO {
            "info"
        } else if level == Level::DEBUG {
            "debug"
        } else {
            "smtp"
        };

        write!(writer, "[{label}]: ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!(target: "unmta", $level, $span);
        let _enter = span.enter();

        $crate::tracing::event!(target: "unmta", $level, $($msg),*)
    }};
}

#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Install the process-wide subscriber.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init(level: LogLevel) {
    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(LineFormat)
                .with_filter(level.filter())
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("unmta")
                })),
        )
        .init();
}
