use colored::*;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mobdev_traits::logging::LoggingService;

/// Prints `YYYY-MM-DD HH:MM LEVEL message`, with the level colored on terminals.
struct PanelFormatter {
    use_color: bool,
}

fn level_label(level: Level, use_color: bool) -> ColoredString {
    let label = match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => " INFO",
        Level::WARN => " WARN",
        Level::ERROR => "ERROR",
    };
    if !use_color {
        return label.normal();
    }
    match level {
        Level::TRACE => label.magenta().bold(),
        Level::DEBUG => label.blue().bold(),
        Level::INFO => label.green().bold(),
        Level::WARN => label.yellow().bold(),
        Level::ERROR => label.red().bold(),
    }
}

impl<S, N> FormatEvent<S, N> for PanelFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let level = *event.metadata().level();
        let time = chrono::Local::now().format("%Y-%m-%d %H:%M");

        write!(writer, "{} {} ", time, level_label(level, self.use_color))?;

        // Debug and trace lines carry the emitting target.
        if level >= Level::DEBUG {
            let target = event.metadata().target();
            if self.use_color {
                write!(writer, "{} ", target.dimmed())?;
            } else {
                write!(writer, "{} ", target)?;
            }
        }

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

pub struct LoggingServiceImpl;

impl LoggingService for LoggingServiceImpl {
    fn init_logging(
        level_str: &str,
        use_color: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let level = Level::from_str(level_str).unwrap_or(Level::INFO);

        let env_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let formatter = PanelFormatter { use_color };

        let layer = Layer::default()
            .with_writer(std::io::stderr)
            .event_format(formatter);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()?;

        Ok(())
    }
}
