//! Logging: console lines plus JSON records on the bus.
//!
//! Every record is printed to stderr and, when a publisher session is
//! attached, forwarded as `{level, task, message, timestamp}` to
//! `<ns>/<unit>/<exp>/logs/app`. Forwarding happens on a dedicated thread so
//! a slow broker never stalls the thread that logged; in particular a bus
//! reader callback may log freely.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};

use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Serialize;

use crate::bus::{BusClient, Qos};

#[derive(Serialize)]
struct LogRecord {
    level: String,
    task: String,
    message: String,
    timestamp: String,
}

struct Forwarder {
    sender: mpsc::Sender<LogRecord>,
}

struct NodeLogger {
    task: String,
    stderr_level: LevelFilter,
    forwarder: Mutex<Option<Forwarder>>,
}

static LOGGER: OnceLock<NodeLogger> = OnceLock::new();

/// Install the process logger under the given task name. Idempotent: the
/// first caller wins, which keeps tests that share a process happy.
pub fn init(task: &str) {
    let logger = LOGGER.get_or_init(|| NodeLogger {
        task: task.to_string(),
        stderr_level: stderr_level_from_env(),
        forwarder: Mutex::new(None),
    });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Start forwarding records to `topic` through `publisher`.
pub fn attach_bus(publisher: Arc<BusClient>, topic: String) {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    let (tx, rx) = mpsc::channel::<LogRecord>();
    std::thread::Builder::new()
        .name("log-forward".into())
        .spawn(move || {
            while let Ok(record) = rx.recv() {
                if let Ok(payload) = serde_json::to_vec(&record) {
                    let _ = publisher.publish(&topic, &payload, Qos::AtMostOnce, false);
                }
            }
        })
        .expect("spawn log forwarder");
    *logger.forwarder.lock().unwrap() = Some(Forwarder { sender: tx });
}

/// Stop forwarding (the job is disconnecting its bus sessions).
pub fn detach_bus() {
    if let Some(logger) = LOGGER.get() {
        *logger.forwarder.lock().unwrap() = None;
    }
}

fn stderr_level_from_env() -> LevelFilter {
    match std::env::var("PETRI_LOG").ok().as_deref() {
        Some("trace") => LevelFilter::Trace,
        Some("debug") => LevelFilter::Debug,
        Some("warn") => LevelFilter::Warn,
        Some("error") => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

impl Log for NodeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = chrono::Utc::now();
        if record.level() <= self.stderr_level {
            eprintln!(
                "{} [{}] {:<5} {}",
                now.format("%Y-%m-%d %H:%M:%S"),
                self.task,
                record.level(),
                record.args()
            );
        }
        if let Some(forwarder) = self.forwarder.lock().unwrap().as_ref() {
            let _ = forwarder.sender.send(LogRecord {
                level: record.level().to_string().to_uppercase(),
                task: self.task.clone(),
                message: record.args().to_string(),
                timestamp: now.to_rfc3339(),
            });
        }
    }

    fn flush(&self) {}
}
