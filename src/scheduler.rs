//! Request admission queues: first-come-first-served, shortest-job-first,
//! and round-robin over quantum-bounded chunks.

use crate::request::Request;
use crate::{LinefsError, Result};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// The scheduling policy, chosen once at startup and immutable for the
/// process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// dispatch in submission order
    Fcfs,
    /// dispatch the smallest `file_size` first
    Sjf,
    /// dispatch FIFO over chunks; a request that exhausts its quantum goes
    /// to the tail
    RoundRobin,
}

impl FromStr for Policy {
    type Err = LinefsError;

    fn from_str(s: &str) -> Result<Policy> {
        match s.to_ascii_lowercase().as_str() {
            "fcfs" => Ok(Policy::Fcfs),
            "sjf" => Ok(Policy::Sjf),
            "rr" => Ok(Policy::RoundRobin),
            _ => Err(LinefsError::Parsing(format!(
                "invalid scheduling policy: {} (must be fcfs, sjf, or rr)",
                s
            ))),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Fcfs => write!(f, "fcfs"),
            Policy::Sjf => write!(f, "sjf"),
            Policy::RoundRobin => write!(f, "rr"),
        }
    }
}

/// min-heap adapter: the queued request with the smallest `file_size` wins.
/// Ties are broken in implementation-defined heap order.
struct Shortest(Request);

impl PartialEq for Shortest {
    fn eq(&self, other: &Shortest) -> bool {
        self.0.file_size == other.0.file_size
    }
}

impl Eq for Shortest {}

impl PartialOrd for Shortest {
    fn partial_cmp(&self, other: &Shortest) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Shortest {
    fn cmp(&self, other: &Shortest) -> Ordering {
        other.0.file_size.cmp(&self.0.file_size)
    }
}

/// the policy-specific ready structure
enum Ready {
    Fifo(VecDeque<Request>),
    BySize(BinaryHeap<Shortest>),
}

impl Ready {
    fn push(&mut self, req: Request) {
        match self {
            Ready::Fifo(queue) => queue.push_back(req),
            Ready::BySize(heap) => heap.push(Shortest(req)),
        }
    }

    fn pop(&mut self) -> Option<Request> {
        match self {
            Ready::Fifo(queue) => queue.pop_front(),
            Ready::BySize(heap) => heap.pop().map(|entry| entry.0),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Ready::Fifo(queue) => queue.is_empty(),
            Ready::BySize(heap) => heap.is_empty(),
        }
    }
}

struct SchedulerState {
    ready: Ready,
    shutdown: bool,
}

/// The admission queue the acceptor submits to and the workers pull from.
///
/// One mutex guards the ready structure and the shutdown flag; one condvar
/// wakes blocked workers. The lock is held only long enough to push or pop,
/// never across I/O.
pub struct Scheduler {
    policy: Policy,
    quantum: Option<Duration>,
    state: Mutex<SchedulerState>,
    available: Condvar,
}

impl Scheduler {
    /// builds a scheduler for `policy`.
    ///
    /// # Errors
    /// returns [`LinefsError::Config`] if the policy is round-robin and
    /// `quantum` is absent or zero
    pub fn new(policy: Policy, quantum: Option<Duration>) -> Result<Scheduler> {
        let quantum = match policy {
            Policy::RoundRobin => match quantum {
                Some(q) if !q.is_zero() => Some(q),
                _ => {
                    return Err(LinefsError::Config(
                        "round robin requires a positive quantum".to_string(),
                    ))
                }
            },
            // the quantum is meaningless outside round-robin
            Policy::Fcfs | Policy::Sjf => None,
        };
        let ready = match policy {
            Policy::Sjf => Ready::BySize(BinaryHeap::new()),
            Policy::Fcfs | Policy::RoundRobin => Ready::Fifo(VecDeque::new()),
        };
        Ok(Scheduler {
            policy,
            quantum,
            state: Mutex::new(SchedulerState {
                ready,
                shutdown: false,
            }),
            available: Condvar::new(),
        })
    }

    /// the policy this scheduler was built with
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// the round-robin time slice, or `None` for the run-to-completion
    /// policies. Workers use this to decide between whole-request and
    /// chunked execution.
    pub fn quantum(&self) -> Option<Duration> {
        self.quantum
    }

    /// inserts a newly admitted request and wakes one waiting worker
    pub fn submit(&self, req: Request) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.ready.push(req);
        self.available.notify_one();
    }

    /// places a partially served round-robin request back at the tail of
    /// the queue, behind everything submitted or requeued before it
    pub fn requeue(&self, req: Request) {
        debug_assert_eq!(self.policy, Policy::RoundRobin);
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.ready.push(req);
        self.available.notify_one();
    }

    /// sets the shutdown flag and wakes every waiting worker
    pub fn signal_shutdown(&self) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.shutdown = true;
        self.available.notify_all();
    }

    /// blocks until a request is ready or shutdown is signalled.
    ///
    /// Returns `None` only when the shutdown flag is set *and* the queue is
    /// empty, so every admitted request is drained before workers exit.
    pub fn next(&self) -> Option<Request> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        while state.ready.is_empty() && !state.shutdown {
            state = self
                .available
                .wait(state)
                .expect("scheduler lock poisoned");
        }
        state.ready.pop()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("policy", &self.policy)
            .field("quantum", &self.quantum)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Connection};
    use crate::request::Request;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    /// builds a request whose payload is exactly `size` bytes on the wire,
    /// backed by a real (immediately abandoned) loopback connection
    fn request_of_size(filename: &str, size: usize) -> Request {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (accepted, _) = listener.accept().expect("accept");
        let conn = Connection::new(accepted).expect("connection");
        drop(client);
        let command = Command::Put {
            filename: filename.to_string(),
            lines: vec!["x".repeat(size - 1)],
        };
        Request::from_command(command, conn, 0)
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("fcfs".parse::<Policy>().unwrap(), Policy::Fcfs);
        assert_eq!("SJF".parse::<Policy>().unwrap(), Policy::Sjf);
        assert_eq!("Rr".parse::<Policy>().unwrap(), Policy::RoundRobin);
        assert!("priority".parse::<Policy>().is_err());
    }

    #[test]
    fn round_robin_requires_a_positive_quantum() {
        assert!(Scheduler::new(Policy::RoundRobin, None).is_err());
        assert!(Scheduler::new(Policy::RoundRobin, Some(Duration::ZERO)).is_err());
        assert!(Scheduler::new(Policy::RoundRobin, Some(Duration::from_millis(10))).is_ok());
    }

    #[test]
    fn quantum_is_the_round_robin_capability() {
        let fcfs = Scheduler::new(Policy::Fcfs, None).unwrap();
        let sjf = Scheduler::new(Policy::Sjf, None).unwrap();
        let rr = Scheduler::new(Policy::RoundRobin, Some(Duration::from_millis(5))).unwrap();
        assert_eq!(fcfs.quantum(), None);
        assert_eq!(sjf.quantum(), None);
        assert_eq!(rr.quantum(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn fcfs_dispatches_in_submission_order() {
        let scheduler = Scheduler::new(Policy::Fcfs, None).unwrap();
        for name in ["a", "b", "c"] {
            scheduler.submit(request_of_size(name, 100));
        }
        scheduler.signal_shutdown();
        let order: Vec<String> = std::iter::from_fn(|| scheduler.next())
            .map(|req| req.filename)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn sjf_dispatches_smallest_first() {
        let scheduler = Scheduler::new(Policy::Sjf, None).unwrap();
        for (name, size) in [("big", 4000), ("tiny", 8), ("mid", 300), ("small", 40)] {
            scheduler.submit(request_of_size(name, size));
        }
        scheduler.signal_shutdown();
        let order: Vec<String> = std::iter::from_fn(|| scheduler.next())
            .map(|req| req.filename)
            .collect();
        assert_eq!(order, ["tiny", "small", "mid", "big"]);
    }

    #[test]
    fn requeue_goes_to_the_tail() {
        let scheduler =
            Scheduler::new(Policy::RoundRobin, Some(Duration::from_millis(10))).unwrap();
        scheduler.submit(request_of_size("a", 10));
        scheduler.submit(request_of_size("b", 10));

        let first = scheduler.next().unwrap();
        assert_eq!(first.filename, "a");
        scheduler.requeue(first);

        scheduler.signal_shutdown();
        let order: Vec<String> = std::iter::from_fn(|| scheduler.next())
            .map(|req| req.filename)
            .collect();
        assert_eq!(order, ["b", "a"]);
    }

    #[test]
    fn next_blocks_until_a_submission_arrives() {
        let scheduler = Arc::new(Scheduler::new(Policy::Fcfs, None).unwrap());
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let req = scheduler.next();
                tx.send(req.map(|r| r.filename)).expect("send");
            })
        };

        thread::sleep(Duration::from_millis(50));
        scheduler.submit(request_of_size("late", 10));

        let received = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker never woke up");
        assert_eq!(received.as_deref(), Some("late"));
        waiter.join().expect("waiter panicked");
    }

    #[test]
    fn shutdown_with_empty_queue_returns_none() {
        let scheduler = Scheduler::new(Policy::Fcfs, None).unwrap();
        scheduler.signal_shutdown();
        assert!(scheduler.next().is_none());
    }

    #[test]
    fn shutdown_drains_queued_requests_first() {
        let scheduler = Scheduler::new(Policy::Fcfs, None).unwrap();
        scheduler.submit(request_of_size("a", 10));
        scheduler.submit(request_of_size("b", 10));
        scheduler.signal_shutdown();
        assert!(scheduler.next().is_some());
        assert!(scheduler.next().is_some());
        assert!(scheduler.next().is_none());
    }

    #[test]
    fn shutdown_wakes_all_blocked_workers() {
        let scheduler = Arc::new(Scheduler::new(Policy::Fcfs, None).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || scheduler.next().is_none())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        scheduler.signal_shutdown();

        for worker in workers {
            assert!(worker.join().expect("worker panicked"));
        }
    }
}
