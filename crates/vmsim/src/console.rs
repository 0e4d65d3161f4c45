//! Log output to standard error.

use log::LevelFilter;
use std::io::Write;

/// Writes log records to standard error in the kernel console's format.
pub struct Console;

static CONSOLE: Console = Console;

impl Console {
    /// Installs the console as the global logger. `verbosity` counts `-v` flags.
    pub fn install(verbosity: u8) {
        if log::set_logger(&CONSOLE).is_err() {
            return;
        }
        log::set_max_level(match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        });
    }
}

impl log::Log for Console {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut stderr = std::io::stderr().lock();
        let _ = write_log_entry_to(&mut stderr, record);
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> std::io::Result<()> {
    #[cfg(debug_assertions)]
    return writeln!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(debug_assertions))]
    return writeln!(writer, "[{:5}] {}", record.level(), record.args());
}
