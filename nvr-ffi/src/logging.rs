//! Log bridge to the host
//!
//! Forwards `log` records to C callbacks supplied by the host engine.

use libc::c_char;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::RwLock;
use std::ffi::CString;

/// Receives one NUL-terminated message, valid only during the call
pub type NvrLogFunction = unsafe extern "C" fn(message: *const c_char);

#[derive(Clone, Copy, Default)]
struct Callbacks {
    debug: Option<NvrLogFunction>,
    warning: Option<NvrLogFunction>,
    error: Option<NvrLogFunction>,
}

pub(crate) struct ForeignLogger {
    callbacks: RwLock<Callbacks>,
}

static LOGGER: ForeignLogger = ForeignLogger {
    callbacks: parking_lot::const_rwlock(Callbacks {
        debug: None,
        warning: None,
        error: None,
    }),
};

impl ForeignLogger {
    fn callback(&self, level: Level) -> Option<NvrLogFunction> {
        let callbacks = self.callbacks.read();
        match level {
            Level::Error => callbacks.error,
            Level::Warn => callbacks.warning,
            Level::Info | Level::Debug | Level::Trace => callbacks.debug,
        }
    }
}

impl Log for ForeignLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.callback(metadata.level()).is_some()
    }

    fn log(&self, record: &Record<'_>) {
        let Some(callback) = self.callback(record.level()) else {
            return;
        };
        if let Some(message) = format_record(record.target(), &record.args().to_string()) {
            unsafe { callback(message.as_ptr()) };
        }
    }

    fn flush(&self) {}
}

/// `"[target] message"` with interior NULs removed
pub(crate) fn format_record(target: &str, message: &str) -> Option<CString> {
    let text = format!("[{}] {}", target, message).replace('\0', "");
    CString::new(text).ok()
}

/// Point the bridge at new callbacks. The logger is registered with `log`
/// on first use; records are discarded while no callback is set.
pub(crate) fn set_callbacks(
    debug: Option<NvrLogFunction>,
    error: Option<NvrLogFunction>,
    warning: Option<NvrLogFunction>,
) {
    *LOGGER.callbacks.write() = Callbacks {
        debug,
        warning,
        error,
    };

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
