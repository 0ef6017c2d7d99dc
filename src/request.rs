//! The schedulable unit handed from the acceptor to the scheduler to a
//! worker.

use crate::protocol::{payload_size, Command, Connection};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// nanoseconds elapsed on the monotonic clock since the first call in this
/// process.
///
/// Timestamps produced by this function are only comparable to each other;
/// `0` doubles as the "not yet stamped" sentinel on [`Request`].
pub fn now_ns() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// The two request types a client can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// store a payload under a filename
    Put,
    /// retrieve the payload stored under a filename
    Get,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Put => write!(f, "PUT"),
            RequestKind::Get => write!(f, "GET"),
        }
    }
}

/// A fully admitted request: the parsed command, its payload, the
/// connection the response goes out on, and the lifecycle timestamps.
///
/// A request is owned by exactly one component at a time. The acceptor
/// builds it and moves it into the scheduler; `Scheduler::next` moves it
/// out to a worker; under round-robin a worker may move it back via
/// `Scheduler::requeue`. On completion a [`snapshot`](Request::snapshot) is
/// recorded and the request (with its connection) is dropped.
#[derive(Debug)]
pub struct Request {
    /// process-unique identifier, used in logs and metrics
    pub id: u64,
    /// PUT or GET
    pub kind: RequestKind,
    /// the store key the request operates on
    pub filename: String,
    /// payload byte count, `Σ(len(line) + 1)` over `file_lines`
    pub file_size: usize,
    /// the payload: the received lines for PUT, the materialized stored
    /// lines for GET
    pub file_lines: Vec<String>,
    /// whether the admission-time store lookup succeeded; always true for
    /// PUT
    pub found: bool,
    /// the connection the response is written to
    pub conn: Connection,
    /// stamped when the connection was accepted
    pub arrival_ns: u64,
    /// stamped at first dispatch; 0 until then
    pub start_ns: u64,
    /// stamped on the completion path; 0 until then
    pub finish_ns: u64,
    /// cursor into `file_lines`, advanced one line at a time by round-robin
    /// chunks
    pub lines_processed: usize,
}

impl Request {
    /// builds a request from a parsed command.
    ///
    /// `arrival_ns` is passed in rather than stamped here: the acceptor
    /// records it when the connection is accepted, before parsing begins.
    pub fn from_command(command: Command, conn: Connection, arrival_ns: u64) -> Request {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        match command {
            Command::Put { filename, lines } => Request {
                id,
                kind: RequestKind::Put,
                filename,
                file_size: payload_size(&lines),
                file_lines: lines,
                found: true,
                conn,
                arrival_ns,
                start_ns: 0,
                finish_ns: 0,
                lines_processed: 0,
            },
            Command::Get { filename } => Request {
                id,
                kind: RequestKind::Get,
                filename,
                file_size: 0,
                file_lines: Vec::new(),
                found: false,
                conn,
                arrival_ns,
                start_ns: 0,
                finish_ns: 0,
                lines_processed: 0,
            },
        }
    }

    /// fills in a GET's payload from the store at admission time, giving
    /// shortest-job-first an accurate size to order by
    pub fn materialize(&mut self, lines: Vec<String>) {
        self.file_size = payload_size(&lines);
        self.file_lines = lines;
        self.found = true;
    }

    /// stamps `start_ns` on first dispatch; later dispatches of a requeued
    /// round-robin request leave it untouched
    pub fn stamp_start(&mut self) {
        if self.start_ns == 0 {
            self.start_ns = now_ns();
        }
    }

    /// stamps `finish_ns`; called on every completion path
    pub fn stamp_finish(&mut self) {
        self.finish_ns = now_ns();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ns_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let b = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        assert_ne!(a, b);
    }
}
