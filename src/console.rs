//! Console output for the kernel
//!
//! Text goes to a sink installed by the platform (a UART, a framebuffer
//! terminal, the host stdout). Until a sink is installed, output is kept in
//! a small backlog that is flushed into the first sink.
//! The `log` facade is routed here through [`KernelLogger`].

use core::fmt::{self, Write};
use spin::Mutex;

const BACKLOG_SIZE: usize = 1024;

/// Output sink: receives already formatted text
pub type ConsoleSink = fn(&str);

/// Console writer interface
pub struct Console {
    sink: Option<ConsoleSink>,
    backlog: heapless::String<BACKLOG_SIZE>,
    dropped: usize,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            sink: None,
            backlog: heapless::String::new(),
            dropped: 0,
        }
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        match self.sink {
            Some(sink) => sink(s),
            None => {
                if self.backlog.push_str(s).is_err() {
                    self.dropped += s.len();
                }
            }
        }
    }

    /// Install `sink`, flushing the backlog into it
    pub fn set_sink(&mut self, sink: ConsoleSink) {
        if !self.backlog.is_empty() {
            sink(&self.backlog);
            self.backlog.clear();
        }
        self.sink = Some(sink);
    }

    /// Text written while no sink was installed
    pub fn backlog(&self) -> &str {
        &self.backlog
    }

    /// Bytes lost because the backlog was full
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Clear the backlog
    pub fn clear(&mut self) {
        self.backlog.clear();
        self.dropped = 0;
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Install the platform's output sink
pub fn set_sink(sink: ConsoleSink) {
    CONSOLE.lock().set_sink(sink);
}

/// Sink writing to the host's stdout
#[cfg(feature = "std")]
pub fn stdout_sink(s: &str) {
    extern crate std;
    std::print!("{}", s);
}

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    // Console::write_str never fails
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// log facade
// ============================================================================

/// `log::Log` implementation printing `[LEVEL] target: message` lines
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            print(format_args!(
                "[{:<5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Route the `log` macros to the console. Returns false if a logger was
/// already installed.
pub fn init_logger(level: log::LevelFilter) -> bool {
    let installed = log::set_logger(&LOGGER).is_ok();
    log::set_max_level(level);
    installed
}
