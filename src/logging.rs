use core::fmt;

use hermit_sync::OnceCell;
use log::{LevelFilter, Metadata, Record, SetLoggerError, set_logger, set_max_level};

/// Sink for formatted log lines, supplied by the platform.
pub type Console = fn(fmt::Arguments<'_>);

/// Data structure to filter driver messages
struct DriverLogger {
	console: OnceCell<Console>,
}

static LOGGER: DriverLogger = DriverLogger {
	console: OnceCell::new(),
};

impl log::Log for DriverLogger {
	fn enabled(&self, _: &Metadata<'_>) -> bool {
		self.console.get().is_some()
	}

	fn flush(&self) {
		// nothing to do
	}

	fn log(&self, record: &Record<'_>) {
		if let Some(console) = self.console.get() {
			console(format_args!(
				"[{}][{}] {}\n",
				record.target(),
				record.level(),
				record.args()
			));
		}
	}
}

/// Installs the driver logger writing through `console`.
///
/// Fails if another logger has already been registered with the `log` facade.
pub fn init(console: Console) -> Result<(), SetLoggerError> {
	let _ = LOGGER.console.set(console);
	set_logger(&LOGGER)?;
	set_max_level(max_level());
	Ok(())
}

/// Determines LevelFilter at compile time
fn max_level() -> LevelFilter {
	let log_level: Option<&'static str> = option_env!("NVETHERNET_LOG_LEVEL_FILTER");
	match log_level {
		Some("Error") => LevelFilter::Error,
		Some("Debug") => LevelFilter::Debug,
		Some("Off") => LevelFilter::Off,
		Some("Trace") => LevelFilter::Trace,
		Some("Warn") => LevelFilter::Warn,
		_ => LevelFilter::Info,
	}
}

macro_rules! infoheader {
	($str:expr) => {{
		info!("");
		info!("{:=^70}", $str);
	}};
}

macro_rules! infoentry {
	($str:expr, $rhs:expr) => (infoentry!($str, "{}", $rhs));
	($str:expr, $($arg:tt)+) => (info!("{:25}{}", concat!($str, ":"), format_args!($($arg)+)));
}

macro_rules! infofooter {
	() => {{
		info!("{:=^70}", '=');
		info!("");
	}};
}
