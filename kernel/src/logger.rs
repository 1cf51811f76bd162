//! Wires the `log` crate's facade to the UART so `log::info!`/`log::warn!`
//! calls scattered through the kernel (trap dispatch, the syscall gateway,
//! the PLIC) end up as lines on the serial console.
//!
//! No timestamps, no targets beyond the level prefix: this kernel has no
//! clock worth formatting and a single log sink, so there's nothing a
//! richer record would buy over the message itself.

use core::fmt::Write;

use crate::spinlock::Spinlock;
use crate::uart;

struct UartWriter;

impl Write for UartWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            uart::put_char(b);
        }
        Ok(())
    }
}

static mut LOCK: Spinlock = Spinlock::new("logger");

struct UartLogger;

impl log::Log for UartLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        unsafe {
            LOCK.acquire();
        }
        let _ = writeln!(UartWriter, "[{}] {}", record.level(), record.args());
        unsafe {
            LOCK.release();
        }
    }

    fn flush(&self) {}
}

static LOGGER: UartLogger = UartLogger;

/// Install the UART-backed logger as `log`'s global sink. Must run after
/// `uart::init` and before anything that calls `log::info!`/`log::warn!`.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Info))
        .expect("logger: already initialized");
}
