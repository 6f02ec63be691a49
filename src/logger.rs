//! Logging setup for the voxfit binaries
//!
//! Drivers only emit `tracing` events; nothing is printed until a subscriber is installed. The
//! helpers here install one with a bracketed, colored format and a default level that `RUST_LOG`
//! overrides.

use tracing::Level;

/// Install the standard subscriber at INFO level.
///
/// Format: `[LEVEL YYYY-MM-DD HH:MM:SS module] message` for INFO/WARN/ERROR and
/// `[LEVEL YYYY-MM-DD HH:MM:SS file:line] message` for DEBUG/TRACE.
///
/// # Example
/// ```no_run
/// use voxfit::init_logger;
///
/// init_logger();
/// tracing::info!("Fit started");
/// ```
///
/// # Environment Variables
/// ```bash
/// RUST_LOG=debug cargo run --bin fit_synthetic
/// RUST_LOG=voxfit::optimizer=debug cargo run --bin fit_synthetic
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the standard subscriber with a custom default level.
///
/// Calling it again after a subscriber is installed does nothing.
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
pub fn init_logger_with_level(default_level: Level) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }
}

/// Default level for a `-v` count: 0 → INFO, 1 → DEBUG, 2+ → TRACE.
pub fn level_from_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn level_tag(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}

struct BracketFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        let level = metadata.level();
        write!(
            writer,
            "[{} {} ",
            level_tag(level),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        let detailed = *level == Level::DEBUG || *level == Level::TRACE;
        match (detailed, metadata.file()) {
            (true, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{filename}")?;
                if let Some(line) = metadata.line() {
                    write!(writer, ":{line}")?;
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
