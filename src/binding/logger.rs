use std::io;
use std::sync::Once;

use parking_lot::Mutex;
use tracing::Metadata;
use tracing_subscriber::fmt::MakeWriter;

/// Log levels on the binding surface.
pub const LOG_ERROR: i32 = 1;
pub const LOG_WARNING: i32 = 2;
pub const LOG_INFO: i32 = 3;
pub const LOG_TRACE: i32 = 4;

type LogCallback = Box<dyn Fn(i32, &str) + Send + Sync>;

static WRITER_SLOT: Mutex<Option<LogCallback>> = Mutex::new(None);
static SUBSCRIBER_INIT: Once = Once::new();

/// Installs a line writer behind the core's tracing output. The tracing
/// subscriber itself is set at most once per process; the callback slot
/// is swappable afterwards.
pub fn enable_logger(writer: impl Fn(i32, &str) + Send + Sync + 'static) {
    *WRITER_SLOT.lock() = Some(Box::new(writer));
    SUBSCRIBER_INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(LogBridge)
            .with_ansi(false)
            .with_target(false)
            .finish();
        // a pre-existing global subscriber keeps precedence
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

pub fn disable_logger() {
    *WRITER_SLOT.lock() = None;
}

struct LogBridge;

pub struct BridgeWriter {
    level: i32,
    buf: Vec<u8>,
}

impl<'a> MakeWriter<'a> for LogBridge {
    type Writer = BridgeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BridgeWriter { level: LOG_INFO, buf: Vec::new() }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        let level = match *meta.level() {
            tracing::Level::ERROR => LOG_ERROR,
            tracing::Level::WARN => LOG_WARNING,
            tracing::Level::INFO => LOG_INFO,
            _ => LOG_TRACE,
        };
        BridgeWriter { level, buf: Vec::new() }
    }
}

impl io::Write for BridgeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if let Some(cb) = WRITER_SLOT.lock().as_ref() {
            let line = String::from_utf8_lossy(&self.buf);
            cb(self.level, line.trim_end());
        }
        self.buf.clear();
        Ok(())
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn writer_receives_emitted_lines() {
        let lines: Arc<StdMutex<Vec<(i32, String)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = lines.clone();
        enable_logger(move |level, msg| {
            sink.lock().unwrap().push((level, msg.to_string()));
        });
        tracing::warn!("pool pressure");
        disable_logger();
        tracing::warn!("after disable");

        let seen = lines.lock().unwrap();
        // the subscriber may not be ours if another test installed one
        // first; when it is, the first line must have arrived pre-disable
        if !seen.is_empty() {
            assert!(seen.iter().any(|(l, m)| *l == LOG_WARNING && m.contains("pool pressure")));
            assert!(!seen.iter().any(|(_, m)| m.contains("after disable")));
        }
    }
}
