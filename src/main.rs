use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Arg, ArgAction, ArgMatches, Command};

mod affinity;

mod protocol;
use protocol::ReadMode;

mod stats;
use stats::GroupResult;

mod worker;
use worker::ConnectPolicy;

mod workload;
use workload::{KEY_PREFIX, VALUE_PREFIX};

const DEFAULT_THREADS_PER_CONN: &str = "1";
const DEFAULT_GET_RATIO: &str = "1.0";
const DEFAULT_WARMUP_REQUESTS: &str = "0";
const DEFAULT_KEY_SIZE: &str = "8";
const DEFAULT_VALUE_SIZE: &str = "16";
const DEFAULT_READ_MODE: &str = "drain-line";
const DEFAULT_CONNECT_POLICY: &str = "abort";
const DEFAULT_TIMEOUT_MS: &str = "5000";
const DEFAULT_RECV_BUF: &str = "1024";

/// Fully validated benchmark parameters, shared read-only by every thread
/// in the topology.
#[derive(Debug)]
pub struct BenchConfig {
    pub server_addr: Ipv4Addr,
    pub base_port: u16,
    pub total_requests: usize,
    pub connections: usize,
    pub threads_per_conn: usize,
    pub core_list: Vec<usize>,
    pub get_ratio: f64,
    pub warmup_requests: usize,
    pub key_size: usize,
    pub value_size: usize,
    pub seed: u64,
    pub csv: bool,
    pub output: Option<PathBuf>,
    pub read_mode: ReadMode,
    pub connect_policy: ConnectPolicy,
    pub timeout_ms: u64,
    pub recv_buf: usize,
}

impl BenchConfig {
    /// Integer division both times; remainders are dropped, so the total
    /// actually issued can be lower than `total_requests`.
    pub fn requests_per_conn(&self) -> usize {
        self.total_requests / self.connections
    }

    pub fn requests_per_thread(&self) -> usize {
        self.requests_per_conn() / self.threads_per_conn
    }

    pub fn from_matches(matches: &ArgMatches) -> Result<Self, String> {
        let seed = matches.get_one::<u64>("seed").copied().unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        });
        let core_list = parse_core_list(matches.get_one::<String>("cores").unwrap())?;

        let config = BenchConfig {
            server_addr: *matches.get_one::<Ipv4Addr>("host").unwrap(),
            base_port: *matches.get_one::<u16>("port").unwrap(),
            total_requests: *matches.get_one::<usize>("requests").unwrap(),
            connections: *matches.get_one::<usize>("conns").unwrap(),
            threads_per_conn: *matches.get_one::<usize>("threads").unwrap(),
            core_list,
            get_ratio: *matches.get_one::<f64>("get_ratio").unwrap(),
            warmup_requests: *matches.get_one::<usize>("warmup").unwrap(),
            key_size: *matches.get_one::<usize>("key_size").unwrap(),
            value_size: *matches.get_one::<usize>("value_size").unwrap(),
            seed,
            csv: matches.get_flag("csv"),
            output: matches.get_one::<String>("output").map(PathBuf::from),
            read_mode: *matches.get_one::<ReadMode>("read_mode").unwrap(),
            connect_policy: *matches.get_one::<ConnectPolicy>("connect_policy").unwrap(),
            timeout_ms: *matches.get_one::<u64>("timeout_ms").unwrap(),
            recv_buf: *matches.get_one::<usize>("recv_buf").unwrap(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.total_requests == 0 {
            return Err("-n: total requests must be > 0".to_string());
        }
        if self.connections == 0 {
            return Err("-c: number of connections must be > 0".to_string());
        }
        if self.threads_per_conn == 0 {
            return Err("-t: threads per connection must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.get_ratio) {
            return Err(format!(
                "-m: GET ratio {} out of range, must be within [0,1]",
                self.get_ratio
            ));
        }
        if self.core_list.len() < self.connections {
            return Err(format!(
                "-l: core list has {} entries but {} connections were requested",
                self.core_list.len(),
                self.connections
            ));
        }
        if self.key_size <= KEY_PREFIX.len() {
            return Err(format!("-k: key size must exceed {}", KEY_PREFIX.len()));
        }
        if self.value_size <= VALUE_PREFIX.len() {
            return Err(format!(
                "-v: value size must exceed {}",
                VALUE_PREFIX.len()
            ));
        }
        if self.base_port as usize + self.connections > u16::MAX as usize + 1 {
            return Err(format!(
                "-p: port range {}..{} exceeds the maximum port",
                self.base_port,
                self.base_port as usize + self.connections
            ));
        }
        if self.recv_buf == 0 {
            return Err("--recv-buf must be > 0".to_string());
        }
        Ok(())
    }
}

fn parse_core_list(list: &str) -> Result<Vec<usize>, String> {
    let mut cores = Vec::new();
    for part in list.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            return Err("-l: invalid core list: empty component".to_string());
        }
        let core = trimmed
            .parse::<usize>()
            .map_err(|e| format!("-l: invalid core id `{}`: {}", trimmed, e))?;
        cores.push(core);
    }
    Ok(cores)
}

fn cli() -> Command {
    // -h is the server address here, so clap's help short flag is disabled
    // and help stays reachable through --help.
    Command::new("kvbench")
        .version("0.1")
        .about("Closed-loop latency/throughput benchmark for GET/SET/SCAN key-value servers")
        .disable_help_flag(true)
        .arg(
            Arg::new("help")
                .long("help")
                .action(ArgAction::Help)
                .help("Print help"),
        )
        .arg(
            Arg::new("host")
                .short('h')
                .long("host")
                .value_name("SERVER_IP")
                .value_parser(clap::value_parser!(Ipv4Addr))
                .required(true)
                .help("Server IP address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("BASE_PORT")
                .value_parser(clap::value_parser!(u16))
                .required(true)
                .help("Base server port; connection c dials base+c"),
        )
        .arg(
            Arg::new("requests")
                .short('n')
                .long("requests")
                .value_parser(clap::value_parser!(usize))
                .required(true)
                .help("Total requests across all connections"),
        )
        .arg(
            Arg::new("conns")
                .short('c')
                .long("conns")
                .value_parser(clap::value_parser!(usize))
                .required(true)
                .help("Number of connections"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads-per-conn")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_THREADS_PER_CONN)
                .help("Worker threads per connection"),
        )
        .arg(
            Arg::new("cores")
                .short('l')
                .long("cores")
                .value_name("CORE,CORE,...")
                .required(true)
                .help("Core ids to pin connections to, one per connection"),
        )
        .arg(
            Arg::new("get_ratio")
                .short('m')
                .long("get-ratio")
                .value_parser(clap::value_parser!(f64))
                .default_value(DEFAULT_GET_RATIO)
                .help("Probability in [0,1] that a request is GET rather than SCAN"),
        )
        .arg(
            Arg::new("csv")
                .short('f')
                .long("csv")
                .action(ArgAction::SetTrue)
                .help("Emit the compact CSV report instead of the human-readable one"),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_parser(clap::value_parser!(u64))
                .help("Workload RNG seed (default: current unix time)"),
        )
        .arg(
            Arg::new("warmup")
                .short('w')
                .long("warmup")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_WARMUP_REQUESTS)
                .help("Warm-up requests issued per connection before measuring"),
        )
        .arg(
            Arg::new("key_size")
                .short('k')
                .long("key-size")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_KEY_SIZE)
                .help("Generated key length in bytes"),
        )
        .arg(
            Arg::new("value_size")
                .short('v')
                .long("value-size")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_VALUE_SIZE)
                .help("Generated value length in bytes"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write the report to FILE instead of stdout"),
        )
        .arg(
            Arg::new("read_mode")
                .long("read-mode")
                .value_parser(clap::value_parser!(ReadMode))
                .default_value(DEFAULT_READ_MODE)
                .help("GET/SET reply drain: drain-line, or the legacy single-read"),
        )
        .arg(
            Arg::new("connect_policy")
                .long("on-connect-error")
                .value_parser(clap::value_parser!(ConnectPolicy))
                .default_value(DEFAULT_CONNECT_POLICY)
                .help("abort the run or skip the thread when a connect fails"),
        )
        .arg(
            Arg::new("timeout_ms")
                .long("timeout-ms")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_TIMEOUT_MS)
                .help("Per-request read deadline in milliseconds, 0 to disable"),
        )
        .arg(
            Arg::new("recv_buf")
                .long("recv-buf")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_RECV_BUF)
                .help("Reply buffer size in bytes"),
        )
}

fn run(config: BenchConfig) -> Result<(), Box<dyn Error>> {
    // Open the sink before any traffic so a bad path fails fast.
    let mut sink: Box<dyn Write> = match &config.output {
        Some(path) => Box::new(
            File::create(path)
                .map_err(|e| format!("cannot open output file {}: {}", path.display(), e))?,
        ),
        None => Box::new(io::stdout()),
    };

    let config = Arc::new(config);
    let groups: Vec<thread::JoinHandle<GroupResult>> = (0..config.connections)
        .map(|c| {
            let config = Arc::clone(&config);
            thread::spawn(move || worker::execute_group(&config, c))
        })
        .collect();

    let mut results = Vec::with_capacity(groups.len());
    for handle in groups {
        match handle.join() {
            Ok(result) => results.push(result),
            Err(_) => return Err("a connection group thread panicked".into()),
        }
    }

    match stats::aggregate(&results) {
        Some(report) => {
            if config.csv {
                stats::render_csv(&mut sink, &report)?;
            } else {
                stats::render_human(&mut sink, &report)?;
            }
            Ok(())
        }
        None => Err("no latency samples were collected; report suppressed".into()),
    }
}

fn main() {
    let mut command = cli();
    let matches = command.get_matches_mut();
    let config = match BenchConfig::from_matches(&matches) {
        Ok(config) => config,
        // Same shape as clap's own rejections: message, usage, exit 2.
        Err(msg) => {
            eprintln!("error: {}\n\n{}", msg, command.render_usage());
            process::exit(2);
        }
    };
    if let Err(e) = run(config) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
