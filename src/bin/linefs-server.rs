//! this binary starts the linefs server
//! to see the list of commands, type: `linefs-server --help`

use clap::{crate_version, value_t, App, Arg};
use linefs::{files, Config, FileStore, LinefsError, LinefsServer, Policy, Result, Scheduler};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "config.json";
const DEFAULT_METRICS: &str = "metrics.csv";
const DEFAULT_PACKET_SIZE: &str = "10";

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    policy: Policy,
    quantum: Option<Duration>,
    packet_size: usize,
    preload: PathBuf,
    config: PathBuf,
    metrics: PathBuf,
}

impl Opt {
    /// validates the command line parameters
    /// returns `Ok<Opt>` if everything is valid
    /// # Errors
    /// returns [`LinefsError::Parsing`] if one of the parameters is invalid
    fn build(
        policy: Policy,
        quantum: Option<u64>,
        packet_size: usize,
        preload: &str,
        config: &str,
        metrics: &str,
    ) -> Result<Opt> {
        let quantum = match (policy, quantum) {
            (Policy::RoundRobin, Some(ms)) if ms > 0 => Some(Duration::from_millis(ms)),
            (Policy::RoundRobin, _) => {
                return Err(LinefsError::Parsing(
                    "--quantum is required for round robin scheduling and must be > 0".to_string(),
                ))
            }
            (_, _) => None,
        };
        if packet_size == 0 {
            return Err(LinefsError::Parsing(
                "--p must be greater than 0".to_string(),
            ));
        }
        Ok(Opt {
            policy,
            quantum,
            packet_size,
            preload: PathBuf::from(preload),
            config: PathBuf::from(config),
            metrics: PathBuf::from(metrics),
        })
    }
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // parse command line args
    let matches = App::new("linefs-server")
        .version(crate_version!())
        .author("linefs developers")
        .about("a multi-threaded file storage server with pluggable request scheduling")
        .arg(
            Arg::with_name("sched")
                .long("sched")
                .value_name("POLICY")
                .help("scheduling policy to use: fcfs, sjf or rr")
                .required(true),
        )
        .arg(
            Arg::with_name("quantum")
                .long("quantum")
                .value_name("MS")
                .help("time quantum in milliseconds, required if --sched rr"),
        )
        .arg(
            Arg::with_name("p")
                .long("p")
                .value_name("N")
                .help("packetization: lines per send batch for GET responses")
                .default_value(DEFAULT_PACKET_SIZE),
        )
        .arg(
            Arg::with_name("file")
                .long("file")
                .value_name("PATH")
                .help("file or directory preloaded into the store")
                .required(true),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .help("path to the JSON configuration file")
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("metrics")
                .long("metrics")
                .value_name("PATH")
                .help("path the per-request metrics are dumped to at shutdown")
                .default_value(DEFAULT_METRICS),
        )
        .get_matches();

    let policy = match value_t!(matches, "sched", Policy) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    let quantum = match matches.value_of("quantum") {
        Some(ms) => match ms.parse::<u64>() {
            Ok(ms) => Some(ms),
            Err(_) => {
                eprintln!("--quantum must be a number of milliseconds");
                exit(1);
            }
        },
        None => None,
    };
    let packet_size = match value_t!(matches, "p", usize) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let opt = match Opt::build(
        policy,
        quantum,
        packet_size,
        matches.value_of("file").unwrap(),
        matches.value_of("config").unwrap(),
        matches.value_of("metrics").unwrap(),
    ) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{:?}", err);
            exit(1);
        }
    };

    // start the server
    if let Err(e) = run(opt) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("linefs-server {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&opt.config)?;
    info!(
        "configuration: {}:{}, {} worker threads, {} policy",
        config.server_ip, config.server_port, config.server_threads, opt.policy
    );
    if let Some(quantum) = opt.quantum {
        info!("quantum: {} ms", quantum.as_millis());
    }
    info!("packetization: {} lines/packet", opt.packet_size);

    let store = Arc::new(FileStore::new());
    preload(&store, &opt.preload)?;
    if store.is_empty() {
        warn!("nothing was preloaded from {}", opt.preload.display());
    } else {
        info!("store preloaded with {} files", store.len());
    }

    let scheduler = Scheduler::new(opt.policy, opt.quantum)?;
    let server = LinefsServer::bind(
        config.server_addr()?,
        Arc::clone(&store),
        scheduler,
        config.server_threads,
        opt.packet_size,
    )?;
    let metrics = server.metrics();

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        shutdown.signal();
    })
    .map_err(|e| LinefsError::Config(format!("cannot install the signal handler: {}", e)))?;

    info!("press Ctrl+C to stop");
    server.run()?;

    info!("saving metrics to {}", opt.metrics.display());
    let file = File::create(&opt.metrics)?;
    metrics.write_csv(&mut BufWriter::new(file))?;
    Ok(())
}

/// reads the file, or every regular file in the directory, into the store
/// under its base name. Unreadable files are skipped with a warning.
fn preload(store: &FileStore, path: &Path) -> Result<()> {
    for file in files::collect_files(path)? {
        match files::read_lines(&file) {
            Ok(lines) => {
                info!("preloaded {} ({} lines)", files::base_name(&file), lines.len());
                store.put(files::base_name(&file), lines);
            }
            Err(e) => warn!("skipping {}: {}", file.display(), e),
        }
    }
    Ok(())
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
