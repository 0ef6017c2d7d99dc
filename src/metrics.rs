//! Per-request service metrics, accumulated by workers and dumped after
//! the drain.

use crate::request::{Request, RequestKind};
use crate::Result;
use std::io::Write;
use std::sync::Mutex;

/// converts a nanosecond interval to fractional milliseconds
pub fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

/// An immutable snapshot of a completed request.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    /// the request's process-unique id
    pub id: u64,
    /// PUT or GET
    pub kind: RequestKind,
    /// the store key the request operated on
    pub filename: String,
    /// payload byte count
    pub file_size: usize,
    /// stamped at accept
    pub arrival_ns: u64,
    /// stamped at first dispatch
    pub start_ns: u64,
    /// stamped at response completion
    pub finish_ns: u64,
}

impl CompletedRequest {
    /// captures the metrics-relevant fields of a request whose completion
    /// path has stamped `finish_ns`
    pub fn snapshot(req: &Request) -> CompletedRequest {
        CompletedRequest {
            id: req.id,
            kind: req.kind,
            filename: req.filename.clone(),
            file_size: req.file_size,
            arrival_ns: req.arrival_ns,
            start_ns: req.start_ns,
            finish_ns: req.finish_ns,
        }
    }

    /// milliseconds from arrival to response completion
    pub fn response_ms(&self) -> f64 {
        ns_to_ms(self.finish_ns.saturating_sub(self.arrival_ns))
    }

    /// milliseconds the request spent queued before first dispatch
    pub fn waiting_ms(&self) -> f64 {
        ns_to_ms(self.start_ns.saturating_sub(self.arrival_ns))
    }
}

/// Append-only record of completed requests, guarded by its own lock.
#[derive(Debug, Default)]
pub struct MetricsSink {
    completed: Mutex<Vec<CompletedRequest>>,
}

impl MetricsSink {
    /// creates an empty sink
    pub fn new() -> MetricsSink {
        MetricsSink {
            completed: Mutex::new(Vec::new()),
        }
    }

    /// appends one completed request
    pub fn record(&self, completed: CompletedRequest) {
        let mut records = self.completed.lock().expect("metrics lock poisoned");
        records.push(completed);
    }

    /// the number of recorded requests
    pub fn len(&self) -> usize {
        let records = self.completed.lock().expect("metrics lock poisoned");
        records.len()
    }

    /// true if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// copies out everything recorded so far
    pub fn snapshot(&self) -> Vec<CompletedRequest> {
        let records = self.completed.lock().expect("metrics lock poisoned");
        records.clone()
    }

    /// writes one CSV header row and one row per completed request
    pub fn write_csv<W: Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(
            writer,
            "request_type,filename,file_size,arrival_time_ns,start_time_ns,finish_time_ns,\
             response_time_ms,waiting_time_ms"
        )?;
        for record in self.snapshot() {
            writeln!(
                writer,
                "{},{},{},{},{},{},{},{}",
                record.kind,
                record.filename,
                record.file_size,
                record.arrival_ns,
                record.start_ns,
                record.finish_ns,
                record.response_ms(),
                record.waiting_ms(),
            )?;
        }
        Ok(())
    }
}
