//! JSON-lines alarm output.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rasp_js_runtime::{AlarmRecord, AlarmSink};
use serde::Serialize;

#[derive(Serialize)]
struct Line<'a> {
    event_time: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a AlarmRecord,
}

enum Target {
    Stdout,
    File(File),
    #[cfg(test)]
    Memory(Vec<u8>),
}

/// Writes one JSON object per alarm.
pub struct JsonLinesAlarmSink {
    target: Mutex<Target>,
}

impl JsonLinesAlarmSink {
    pub fn stdout() -> Self {
        Self {
            target: Mutex::new(Target::Stdout),
        }
    }

    /// Append to `path`, creating it if needed.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            target: Mutex::new(Target::File(file)),
        })
    }

    #[cfg(test)]
    fn memory() -> Self {
        Self {
            target: Mutex::new(Target::Memory(Vec::new())),
        }
    }

    fn write(&self, record: &AlarmRecord) -> io::Result<()> {
        let line = Line {
            event_time: Utc::now(),
            record,
        };
        let mut json = serde_json::to_vec(&line)?;
        json.push(b'\n');

        let mut target = self.target.lock();
        match &mut *target {
            Target::Stdout => io::stdout().lock().write_all(&json),
            Target::File(file) => file.write_all(&json),
            #[cfg(test)]
            Target::Memory(buf) => {
                buf.extend_from_slice(&json);
                Ok(())
            }
        }
    }
}

impl AlarmSink for JsonLinesAlarmSink {
    fn alarm(&self, record: AlarmRecord) {
        if let Err(e) = self.write(&record) {
            tracing::error!("[alarm] Failed to write alarm: {}", e);
        }
    }
}
