//! The linefs-client executable supports two modes:
//!
//! `linefs-client --interactive`
//!
//!     Prompts for `put <local_file>` and `get <remote_file>` commands and
//!     runs them against the configured server. Downloads are written to
//!     `client_outputs/downloaded_<name>`. `quit` or `exit` leaves.
//!
//! `linefs-client --test <dir> [--requests N]`
//!
//!     Starts `client_threads` threads (from the configuration file), each
//!     issuing N random PUT/GET operations against files drawn from `dir`,
//!     then prints a summary.

use clap::{crate_version, value_t, App, Arg};
use crossbeam::channel;
use linefs::{files, Config, LinefsClient, LinefsError, Result};
use rand::Rng;
use std::fs;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "config.json";
const DEFAULT_REQUESTS: &str = "10";
const OUTPUT_DIR: &str = "client_outputs";

/// the outcome of one operation issued by a test-mode thread
#[derive(Debug)]
struct OpReport {
    thread_id: usize,
    op: &'static str,
    filename: String,
    ok: bool,
}

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("linefs-client")
        .version(crate_version!())
        .author("linefs developers")
        .about("client for the linefs file storage server")
        .arg(
            Arg::with_name("interactive")
                .long("interactive")
                .help("run in interactive mode")
                .conflicts_with("test"),
        )
        .arg(
            Arg::with_name("test")
                .long("test")
                .value_name("DIR")
                .help("run test mode with files from this directory"),
        )
        .arg(
            Arg::with_name("requests")
                .long("requests")
                .value_name("N")
                .help("number of requests per thread in test mode")
                .default_value(DEFAULT_REQUESTS),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .help("path to the JSON configuration file")
                .default_value(DEFAULT_CONFIG),
        )
        .get_matches();

    let config = match Config::load(Path::new(matches.value_of("config").unwrap())) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:?}", e);
            exit(1);
        }
    };
    let requests = match value_t!(matches, "requests", usize) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let result = if matches.is_present("interactive") {
        interactive_mode(&config)
    } else if let Some(dir) = matches.value_of("test") {
        test_mode(&config, Path::new(dir), requests)
    } else {
        eprintln!("no mode specified, use --interactive or --test <dir>");
        exit(1);
    };

    if let Err(e) = result {
        eprintln!("{:?}", e);
        exit(1);
    }
}

/// reads `put`/`get` commands from stdin and runs them one at a time
fn interactive_mode(config: &Config) -> Result<()> {
    let addr = config.server_addr()?;
    fs::create_dir_all(OUTPUT_DIR)?;

    println!("=== Interactive Client Mode ===");
    println!("  put <local_file>    upload file to server");
    println!("  get <remote_file>   download file from server");
    println!("  quit                exit");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut command = String::new();
        if stdin.lock().read_line(&mut command)? == 0 {
            break;
        }
        let mut tokens = command.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some("quit"), _) | (Some("exit"), _) => break,
            (Some("put"), Some(filename)) => match run_put(addr, Path::new(filename)) {
                Ok(()) => println!("PUT {} - SUCCESS", filename),
                Err(e) => println!("PUT {} - FAILED: {}", filename, e),
            },
            (Some("get"), Some(filename)) => {
                let output = PathBuf::from(OUTPUT_DIR).join(format!("downloaded_{}", filename));
                match run_get(addr, filename, &output) {
                    Ok(count) => println!("GET {} - SUCCESS ({} lines)", filename, count),
                    Err(e) => println!("GET {} - FAILED: {}", filename, e),
                }
            }
            (Some("put"), None) => println!("Usage: put <local_file>"),
            (Some("get"), None) => println!("Usage: get <remote_file>"),
            (None, _) => {}
            (Some(op), _) => println!("unknown command: {}", op),
        }
    }
    Ok(())
}

/// hammers the server from `client_threads` threads, each issuing
/// `requests` random PUT/GET operations against the test files
fn test_mode(config: &Config, test_dir: &Path, requests: usize) -> Result<()> {
    let addr = config.server_addr()?;
    let test_files = files::collect_files(test_dir)?;
    if test_files.is_empty() {
        return Err(LinefsError::Parsing(format!(
            "no test files found in {}",
            test_dir.display()
        )));
    }
    fs::create_dir_all(OUTPUT_DIR)?;

    println!("=== Running Test Mode ===");
    println!("client threads: {}", config.client_threads);
    println!("requests per thread: {}", requests);
    println!("test files: {}", test_files.len());

    let (tx, rx) = channel::unbounded::<OpReport>();
    let start = Instant::now();

    let mut handles = Vec::with_capacity(config.client_threads);
    for thread_id in 0..config.client_threads {
        let tx = tx.clone();
        let test_files = test_files.clone();
        handles.push(thread::spawn(move || {
            client_thread(thread_id, addr, &test_files, requests, &tx)
        }));
    }
    drop(tx);

    // aggregate outcomes as the threads report them
    let mut succeeded = 0_usize;
    let mut failed = 0_usize;
    for report in rx {
        debug!(
            "thread {} {} {}: {}",
            report.thread_id,
            report.op,
            report.filename,
            if report.ok { "ok" } else { "failed" }
        );
        if report.ok {
            succeeded += 1;
        } else {
            failed += 1;
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            eprintln!("a client thread panicked");
        }
    }

    println!("=== Test Complete ===");
    println!("total time: {} ms", start.elapsed().as_millis());
    println!("total requests: {}", succeeded + failed);
    println!("succeeded: {}", succeeded);
    println!("failed: {}", failed);
    Ok(())
}

/// one test-mode thread: random PUTs and GETs with a short pause between
fn client_thread(
    thread_id: usize,
    addr: SocketAddr,
    test_files: &[PathBuf],
    requests: usize,
    tx: &channel::Sender<OpReport>,
) {
    let mut rng = rand::thread_rng();
    for i in 0..requests {
        let file = &test_files[rng.gen_range(0..test_files.len())];
        let name = files::base_name(file);

        let report = if rng.gen_bool(0.5) {
            OpReport {
                thread_id,
                op: "PUT",
                filename: name.clone(),
                ok: run_put(addr, file).is_ok(),
            }
        } else {
            let output =
                PathBuf::from(OUTPUT_DIR).join(format!("output_{}_{}_{}", thread_id, i, name));
            OpReport {
                thread_id,
                op: "GET",
                filename: name.clone(),
                ok: run_get(addr, &name, &output).is_ok(),
            }
        };
        if tx.send(report).is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// uploads a local file under its base name
fn run_put(addr: SocketAddr, path: &Path) -> Result<()> {
    let lines = files::read_lines(path)?;
    LinefsClient::connect(addr)?.put(&files::base_name(path), &lines)
}

/// downloads a stored file and writes it to `output`; returns the line count
fn run_get(addr: SocketAddr, filename: &str, output: &Path) -> Result<usize> {
    let lines = LinefsClient::connect(addr)?.get(filename)?;
    files::write_lines(output, &lines)?;
    Ok(lines.len())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
