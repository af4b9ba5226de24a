//! Diagnostics sink — ambient logging.
//!
//! A handle that implements [`core::fmt::Write`] over whatever the
//! embedding firmware's console actually is (UART, semihosting, a ring
//! buffer), plus a pair of macros — [`net_trace!`] and [`net_debug!`] —
//! that expand to nothing at all when their feature is off, so the noisy
//! one compiles away entirely without its feature enabled. There's no
//! `log`/`tracing` dependency here: on a controller this small there's no
//! registry of global loggers to install, only a single fixed sink the
//! firmware wires up once at boot.

use core::fmt;

/// A diagnostics sink, implemented by the embedding firmware over its own
/// console driver.
pub trait Sink: Sync {
    fn write_str(&self, s: &str);
}

struct NullSink;

impl Sink for NullSink {
    fn write_str(&self, _s: &str) {}
}

static NULL_SINK: NullSink = NullSink;

// Single cooperative thread of execution: set once at boot, before the
// scheduler dispatches to any task.
static mut ACTIVE_SINK: Option<&'static dyn Sink> = None;

/// Install the sink that [`net_trace!`]/[`net_debug!`] write through.
/// Call once during startup, before the scheduler runs any task.
pub fn set_sink(sink: &'static dyn Sink) {
    unsafe {
        ACTIVE_SINK = Some(sink);
    }
}

fn current_sink() -> &'static dyn Sink {
    unsafe { ACTIVE_SINK.unwrap_or(&NULL_SINK) }
}

/// `fmt::Write` adapter over the active [`Sink`], for the `write!`-based
/// macros below.
pub struct Writer;

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        current_sink().write_str(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _write(args: fmt::Arguments) {
    use fmt::Write;
    let _ = Writer.write_fmt(args);
    let _ = Writer.write_str("\n");
}

/// Always-on diagnostic line — protocol errors, table exhaustion, anything
/// worth seeing in a production image. Unconditional.
#[macro_export]
macro_rules! net_debug {
    ($($arg:tt)*) => {
        $crate::diag::_write(format_args!($($arg)*))
    };
}

/// Per-packet trace output, compiled out entirely unless the `trace`
/// feature is enabled — one knob for the noisy per-packet paths (TX
/// frame, RX frame, TCP timeout) rather than a single verbosity level.
#[cfg(feature = "trace")]
#[macro_export]
macro_rules! net_trace {
    ($($arg:tt)*) => {
        $crate::diag::_write(format_args!($($arg)*))
    };
}

#[cfg(not(feature = "trace"))]
#[macro_export]
macro_rules! net_trace {
    ($($arg:tt)*) => {};
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::fmt::Write as _;

    struct CapturingSink {
        buf: RefCell<heapless_line::Line>,
    }

    // SAFETY: test-only, single-threaded.
    unsafe impl Sync for CapturingSink {}

    mod heapless_line {
        use core::fmt::{self, Write};
        pub struct Line {
            data: [u8; 256],
            len: usize,
        }
        impl Line {
            pub const fn new() -> Self {
                Line { data: [0; 256], len: 0 }
            }
            pub fn as_str(&self) -> &str {
                core::str::from_utf8(&self.data[..self.len]).unwrap()
            }
        }
        impl Write for Line {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                let bytes = s.as_bytes();
                let n = bytes.len().min(self.data.len() - self.len);
                self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
                self.len += n;
                Ok(())
            }
        }
    }

    impl Sink for CapturingSink {
        fn write_str(&self, s: &str) {
            let _ = self.buf.borrow_mut().write_str(s);
        }
    }

    #[test]
    fn net_debug_reaches_the_installed_sink() {
        static SINK: CapturingSink = CapturingSink {
            buf: RefCell::new(heapless_line::Line::new()),
        };
        set_sink(&SINK);
        net_debug!("hello {}", 42);
        assert_eq!(SINK.buf.borrow().as_str(), "hello 42\n");
    }

    #[test]
    fn null_sink_is_the_default_before_set_sink() {
        // current_sink() falls back to NullSink and must not panic.
        let _ = current_sink();
    }
}
