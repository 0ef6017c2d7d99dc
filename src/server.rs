//! The TCP server: one acceptor thread admitting requests, N worker
//! threads serving them through the scheduler.

use crate::metrics::{ns_to_ms, CompletedRequest, MetricsSink};
use crate::protocol::{self, Connection};
use crate::request::{now_ns, Request, RequestKind};
use crate::scheduler::Scheduler;
use crate::store::FileStore;
use crate::{LinefsError, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// how long the acceptor sleeps between polls of an idle listener
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A handle for requesting a graceful shutdown from another thread (a
/// signal handler, a test).
///
/// Signalling stops the acceptor from admitting new connections and wakes
/// every worker; workers drain the queue before exiting, so all admitted
/// work completes.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    scheduler: Arc<Scheduler>,
}

impl ShutdownHandle {
    /// sets the shutdown flag and signals the scheduler
    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.scheduler.signal_shutdown();
    }

    /// true once a shutdown has been requested
    pub fn is_signalled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A bound, not-yet-running file server.
///
/// # Example
/// Serve an empty store on an ephemeral port with two workers under FCFS:
/// ```no_run
/// use std::sync::Arc;
/// use linefs::{FileStore, LinefsServer, Policy, Scheduler};
/// # fn main() -> linefs::Result<()> {
/// let store = Arc::new(FileStore::new());
/// let scheduler = Scheduler::new(Policy::Fcfs, None)?;
/// let server = LinefsServer::bind("127.0.0.1:0", store, scheduler, 2, 10)?;
/// let shutdown = server.shutdown_handle();
/// server.run()?; // blocks until `shutdown.signal()` and the drain
/// # Ok(())
/// # }
/// ```
pub struct LinefsServer {
    listener: TcpListener,
    store: Arc<FileStore>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<MetricsSink>,
    shutdown: Arc<AtomicBool>,
    workers: usize,
    packet_size: usize,
}

impl LinefsServer {
    /// binds a listener and prepares the server.
    ///
    /// `workers` is the size of the worker pool and `packet_size` the
    /// number of lines per send batch for non-chunked GET responses.
    ///
    /// # Errors
    /// returns [`LinefsError::Config`] if `workers` or `packet_size` is
    /// zero, and an IO error if the address cannot be bound
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        store: Arc<FileStore>,
        scheduler: Scheduler,
        workers: usize,
        packet_size: usize,
    ) -> Result<LinefsServer> {
        if workers == 0 {
            return Err(LinefsError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }
        if packet_size == 0 {
            return Err(LinefsError::Config(
                "packet size must be at least 1".to_string(),
            ));
        }
        let listener = TcpListener::bind(addr)?;
        Ok(LinefsServer {
            listener,
            store,
            scheduler: Arc::new(scheduler),
            metrics: Arc::new(MetricsSink::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            workers,
            packet_size,
        })
    }

    /// the address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// a handle to the sink completed requests are recorded in
    pub fn metrics(&self) -> Arc<MetricsSink> {
        Arc::clone(&self.metrics)
    }

    /// a handle other threads can use to request a graceful shutdown
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            scheduler: Arc::clone(&self.scheduler),
        }
    }

    /// starts the worker pool and runs the acceptor loop on the calling
    /// thread; returns after a shutdown is signalled and every worker has
    /// drained and exited
    pub fn run(self) -> Result<()> {
        let LinefsServer {
            listener,
            store,
            scheduler,
            metrics,
            shutdown,
            workers,
            packet_size,
        } = self;

        info!(
            "listening on {} ({} workers, {} policy)",
            listener.local_addr()?,
            workers,
            scheduler.policy()
        );

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let scheduler = Arc::clone(&scheduler);
            let store = Arc::clone(&store);
            let metrics = Arc::clone(&metrics);
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker_loop(id, scheduler, store, metrics, packet_size))?;
            handles.push(handle);
        }

        accept_loop(&listener, &store, &scheduler, &shutdown);

        // idempotent; the acceptor may have exited through a handle that
        // already signalled
        scheduler.signal_shutdown();

        info!("waiting for workers to drain");
        for handle in handles {
            if handle.join().is_err() {
                error!("a worker thread panicked");
            }
        }
        info!("shutdown complete ({} requests served)", metrics.len());
        Ok(())
    }
}

/// accepts connections until the shutdown flag is raised.
///
/// The listener runs non-blocking so the flag is observed within
/// [`ACCEPT_POLL`] even while idle. Parsing happens here, on the accepting
/// thread; admission throughput is deliberately tied to parse latency.
fn accept_loop(
    listener: &TcpListener,
    store: &Arc<FileStore>,
    scheduler: &Arc<Scheduler>,
    shutdown: &AtomicBool,
) {
    if let Err(e) = listener.set_nonblocking(true) {
        error!("cannot poll the listener: {}", e);
        return;
    }

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                debug!("accepted connection from {}", peer);
                if let Err(e) = admit(stream, store, scheduler) {
                    error!("failed to admit connection from {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => error!("accept failed: {}", e),
        }
    }
    info!("acceptor exiting");
}

/// parses one request to completion, stamps its arrival, materializes GET
/// payloads from the store, and submits it to the scheduler.
///
/// A request that fails to parse is answered `ERROR Malformed request` and
/// never submitted.
fn admit(stream: TcpStream, store: &FileStore, scheduler: &Scheduler) -> Result<()> {
    let arrival_ns = now_ns();
    // accepted sockets can inherit the listener's non-blocking mode
    stream.set_nonblocking(false)?;
    let mut conn = Connection::new(stream)?;

    let command = match conn.read_command() {
        Ok(command) => command,
        Err(e) => {
            warn!("malformed request from {}: {}", conn.peer_addr(), e);
            let _ = conn.send_line(&format!("{} Malformed request", protocol::ERROR));
            return Ok(());
        }
    };

    let mut req = Request::from_command(command, conn, arrival_ns);
    if req.kind == RequestKind::Get {
        if let Some(lines) = store.get(&req.filename) {
            req.materialize(lines);
        }
    }
    debug!(
        "admitted request {}: {} {} ({} bytes)",
        req.id, req.kind, req.filename, req.file_size
    );
    scheduler.submit(req);
    Ok(())
}

/// pulls requests until the scheduler reports drained shutdown. Non-RR
/// requests are served to completion; under RR each turn serves one
/// quantum-bounded chunk and requeues if the request is not done.
#[instrument(skip(scheduler, store, metrics, packet_size))]
fn worker_loop(
    id: usize,
    scheduler: Arc<Scheduler>,
    store: Arc<FileStore>,
    metrics: Arc<MetricsSink>,
    packet_size: usize,
) {
    while let Some(mut req) = scheduler.next() {
        req.stamp_start();
        match scheduler.quantum() {
            None => {
                if let Err(e) = serve_request(&mut req, &store, packet_size) {
                    debug!("request {} failed mid-response: {}", req.id, e);
                }
                finish(req, &metrics);
            }
            Some(quantum) => {
                if serve_chunk(&mut req, &store, quantum) {
                    finish(req, &metrics);
                } else {
                    scheduler.requeue(req);
                }
            }
        }
    }
    debug!("worker exiting");
}

/// stamps the completion, records the snapshot, and drops the request
/// (closing its connection)
fn finish(mut req: Request, metrics: &MetricsSink) {
    req.stamp_finish();
    debug!(
        "completed {} {} (response time: {:.3} ms)",
        req.kind,
        req.filename,
        ns_to_ms(req.finish_ns - req.arrival_ns)
    );
    metrics.record(CompletedRequest::snapshot(&req));
}

/// serves a request to completion: the FCFS/SJF execution path.
///
/// An `Err` here means the client socket failed mid-response; the caller
/// still finishes and records the request.
fn serve_request(req: &mut Request, store: &FileStore, packet_size: usize) -> Result<()> {
    match req.kind {
        RequestKind::Put => {
            store.put(req.filename.clone(), req.file_lines.clone());
            req.conn.send_line(protocol::OK)
        }
        RequestKind::Get => {
            if !req.found {
                return req
                    .conn
                    .send_line(&format!("{} File not found", protocol::ERROR));
            }
            req.conn.send_line(protocol::OK)?;
            req.conn
                .send_line(&format!("{} {}", protocol::SIZE, req.file_size))?;
            req.conn.send_file(&req.file_lines, packet_size)
        }
    }
}

/// serves one round-robin chunk, bounded by `quantum`.
///
/// Returns true when the request is complete: every line sent, or a PUT
/// stored, or the connection dead (a failed send is completion, never a
/// requeue). At least one line goes out per turn, so a GET with K lines
/// needs at most K chunks; the elapsed check runs after each send.
fn serve_chunk(req: &mut Request, store: &FileStore, quantum: Duration) -> bool {
    match req.kind {
        // a PUT is atomic: the payload already arrived at admission
        RequestKind::Put => {
            store.put(req.filename.clone(), req.file_lines.clone());
            let _ = req.conn.send_line(protocol::OK);
            true
        }
        RequestKind::Get => {
            if req.lines_processed == 0 {
                if !req.found {
                    let _ = req
                        .conn
                        .send_line(&format!("{} File not found", protocol::ERROR));
                    return true;
                }
                if req.conn.send_line(protocol::OK).is_err() {
                    return true;
                }
                let size_line = format!("{} {}", protocol::SIZE, req.file_size);
                if req.conn.send_line(&size_line).is_err() {
                    return true;
                }
            }

            let chunk_start = Instant::now();
            loop {
                if req.lines_processed >= req.file_lines.len() {
                    let _ = req.conn.send_line(protocol::END);
                    return true;
                }
                let line = &req.file_lines[req.lines_processed];
                if req.conn.send_line(line).is_err() {
                    return true;
                }
                req.lines_processed += 1;
                if req.lines_processed >= req.file_lines.len() {
                    let _ = req.conn.send_line(protocol::END);
                    return true;
                }
                if chunk_start.elapsed() >= quantum {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use std::io::{BufRead, BufReader};

    fn lines(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    fn socket_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (accepted, _) = listener.accept().expect("accept");
        (Connection::new(accepted).expect("connection"), client)
    }

    fn get_request(filename: &str, payload: &[&str]) -> (Request, TcpStream) {
        let (conn, client) = socket_pair();
        let mut req = Request::from_command(
            Command::Get {
                filename: filename.to_string(),
            },
            conn,
            now_ns(),
        );
        req.materialize(lines(payload));
        (req, client)
    }

    #[test]
    fn serve_request_stores_a_put_and_replies_ok() {
        let (conn, client) = socket_pair();
        let mut req = Request::from_command(
            Command::Put {
                filename: "a.txt".to_string(),
                lines: lines(&["hello", "world"]),
            },
            conn,
            now_ns(),
        );
        let store = FileStore::new();
        serve_request(&mut req, &store, 10).expect("serve");

        assert_eq!(store.get("a.txt"), Some(lines(&["hello", "world"])));
        let mut reader = BufReader::new(client);
        let mut reply = String::new();
        reader.read_line(&mut reply).expect("read");
        assert_eq!(reply, "OK\n");
    }

    #[test]
    fn serve_request_answers_a_missing_get_with_an_error() {
        let (conn, client) = socket_pair();
        let mut req = Request::from_command(
            Command::Get {
                filename: "nope".to_string(),
            },
            conn,
            now_ns(),
        );
        let store = FileStore::new();
        serve_request(&mut req, &store, 10).expect("serve");

        let mut reader = BufReader::new(client);
        let mut reply = String::new();
        reader.read_line(&mut reply).expect("read");
        assert_eq!(reply, "ERROR File not found\n");
    }

    #[test]
    fn serve_request_sends_the_full_get_response() {
        let (mut req, client) = get_request("a.txt", &["hello", "world"]);
        let store = FileStore::new();
        serve_request(&mut req, &store, 10).expect("serve");
        drop(req);

        let mut received = String::new();
        let mut reader = BufReader::new(client);
        std::io::Read::read_to_string(&mut reader, &mut received).expect("read");
        assert_eq!(received, "OK\nSIZE 12\nhello\nworld\nEND\n");
    }

    #[test]
    fn a_get_with_k_lines_needs_at_most_k_chunks() {
        let payload = ["one", "two", "three", "four", "five"];
        let (mut req, client) = get_request("a.txt", &payload);
        let store = FileStore::new();

        // a 1ns quantum expires after every line, forcing maximal chunking
        let quantum = Duration::from_nanos(1);
        let mut chunks = 0;
        while !serve_chunk(&mut req, &store, quantum) {
            chunks += 1;
            assert!(chunks <= payload.len(), "no forward progress");
        }
        chunks += 1;
        assert!(chunks <= payload.len());
        drop(req);

        let mut received = String::new();
        let mut reader = BufReader::new(client);
        std::io::Read::read_to_string(&mut reader, &mut received).expect("read");
        assert_eq!(received, "OK\nSIZE 19\none\ntwo\nthree\nfour\nfive\nEND\n");
    }

    #[test]
    fn the_ok_and_size_preamble_goes_out_only_on_the_first_chunk() {
        let (mut req, client) = get_request("a.txt", &["a", "b", "c"]);
        let store = FileStore::new();
        let quantum = Duration::from_nanos(1);
        while !serve_chunk(&mut req, &store, quantum) {}
        drop(req);

        let mut received = String::new();
        let mut reader = BufReader::new(client);
        std::io::Read::read_to_string(&mut reader, &mut received).expect("read");
        assert_eq!(received.matches("OK").count(), 1);
        assert_eq!(received.matches("SIZE").count(), 1);
    }

    #[test]
    fn a_chunked_get_of_an_empty_file_completes_in_one_chunk() {
        let (mut req, client) = get_request("empty", &[]);
        let store = FileStore::new();
        assert!(serve_chunk(&mut req, &store, Duration::from_millis(10)));
        drop(req);

        let mut received = String::new();
        let mut reader = BufReader::new(client);
        std::io::Read::read_to_string(&mut reader, &mut received).expect("read");
        assert_eq!(received, "OK\nSIZE 0\nEND\n");
    }

    #[test]
    fn a_missing_file_under_round_robin_is_an_error_too() {
        let (conn, client) = socket_pair();
        let mut req = Request::from_command(
            Command::Get {
                filename: "nope".to_string(),
            },
            conn,
            now_ns(),
        );
        let store = FileStore::new();
        assert!(serve_chunk(&mut req, &store, Duration::from_millis(10)));
        drop(req);

        let mut received = String::new();
        let mut reader = BufReader::new(client);
        std::io::Read::read_to_string(&mut reader, &mut received).expect("read");
        assert_eq!(received, "ERROR File not found\n");
    }

    #[test]
    fn a_dead_connection_counts_as_completion_not_a_requeue() {
        // a payload far larger than the socket buffers, so sending must
        // eventually observe the peer's reset
        let payload: Vec<String> = (0..100_000).map(|i| format!("line {:06}", i)).collect();
        let payload_refs: Vec<&str> = payload.iter().map(|s| s.as_str()).collect();
        let (mut req, client) = get_request("big", &payload_refs);
        drop(client);
        thread::sleep(Duration::from_millis(50));

        let store = FileStore::new();
        let complete = serve_chunk(&mut req, &store, Duration::from_secs(5));
        assert!(complete);
        assert!(req.lines_processed < payload.len());
    }
}
