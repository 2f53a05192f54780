use std::net::SocketAddrV4;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use crate::affinity;
use crate::protocol::{self, KvClient};
use crate::stats::{thread_throughput, GroupResult};
use crate::workload::{thread_seed, RequestKind, WorkloadGenerator};
use crate::BenchConfig;

/// What to do when a worker cannot reach the server. `Abort` kills the
/// whole run (the historical behavior); `Skip` lets the thread bow out and
/// the run degrade to a smaller sample set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    Abort,
    Skip,
}

impl FromStr for ConnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(ConnectPolicy::Abort),
            "skip" => Ok(ConnectPolicy::Skip),
            _ => Err(format!("Unknown connect policy: {}", s)),
        }
    }
}

#[derive(Debug, Default)]
struct ThreadResult {
    samples: Vec<u64>,
    failures: u64,
}

/// The measurement loop of one worker thread. The thread owns its socket
/// and its sample buffer outright, so the loop runs lock-free.
///
/// `sibling` is `None` for the group's primary, which runs the warm-up
/// before measuring. Siblings carry their zero-based index, never warm up,
/// and start while the primary may still be warming the server. That
/// overlap window is intentional and is not synchronized away.
fn run_worker(cfg: &BenchConfig, group: usize, sibling: Option<usize>) -> ThreadResult {
    let addr = SocketAddrV4::new(cfg.server_addr, cfg.base_port + group as u16);
    let mut client = match KvClient::connect(addr, cfg.read_mode, cfg.recv_buf, cfg.timeout_ms) {
        Ok(client) => client,
        Err(e) => match cfg.connect_policy {
            ConnectPolicy::Abort => {
                eprintln!("connect to {}: {}", addr, e);
                process::exit(1);
            }
            ConnectPolicy::Skip => {
                eprintln!("connect to {}: {} (thread skipped)", addr, e);
                return ThreadResult::default();
            }
        },
    };

    let mut gen = WorkloadGenerator::new(
        thread_seed(cfg.seed, group, sibling),
        cfg.get_ratio,
        cfg.key_size,
        cfg.value_size,
    );

    if sibling.is_none() {
        for i in 0..cfg.warmup_requests {
            let key = gen.key(i);
            let res = client
                .warmup(&protocol::set_command(&key, &gen.value(i)))
                .and_then(|_| client.warmup(&protocol::get_command(&key)));
            if let Err(e) = res {
                eprintln!("conn {}: warm-up request {} failed: {}", group, i, e);
                return ThreadResult::default();
            }
        }
    }

    let per_thread = cfg.requests_per_thread();
    let mut result = ThreadResult {
        samples: Vec::with_capacity(per_thread),
        failures: 0,
    };

    for i in 0..per_thread {
        // Siblings of the same group deliberately cover the same key
        // range: the index depends on the group, not the thread.
        let index = group * per_thread + i;
        let outcome = match gen.classify() {
            RequestKind::Get => client.send_and_measure(&protocol::get_command(&gen.key(index))),
            RequestKind::Scan => client.send_and_measure_scan(),
        };
        match outcome {
            Ok(us) => result.samples.push(us),
            Err(e) => {
                // Non-fatal errors, timeouts included, keep the loop
                // going; `protocol::is_fatal` documents the desync
                // window a late reply opens on this socket.
                result.failures += 1;
                if protocol::is_fatal(&e) {
                    eprintln!(
                        "conn {} worker {}: stopping after {}/{} requests: {}",
                        group,
                        sibling.map_or(0, |s| s + 1),
                        i + 1,
                        per_thread,
                        e
                    );
                    break;
                }
            }
        }
    }

    result
}

/// Run one connection group to completion: pin to its core, spawn the
/// sibling workers, run the primary loop, join, and fold the per-thread
/// results into one `GroupResult`.
///
/// The pin happens before the siblings are spawned, so they inherit the
/// mask and the whole group contends for the same core on purpose.
pub fn execute_group(cfg: &Arc<BenchConfig>, group: usize) -> GroupResult {
    let core = cfg.core_list[group];
    if let Err(e) = affinity::pin_current_thread(core) {
        eprintln!("pin conn {} to core {}: {}", group, core, e);
        process::exit(1);
    }

    let siblings: Vec<_> = (0..cfg.threads_per_conn - 1)
        .map(|s| {
            let cfg = Arc::clone(cfg);
            thread::spawn(move || run_worker(&cfg, group, Some(s)))
        })
        .collect();

    let mut threads = vec![run_worker(cfg, group, None)];
    for handle in siblings {
        threads.push(handle.join().unwrap());
    }

    let mut result = GroupResult::default();
    for t in &threads {
        // Threads that produced nothing contribute no rate at all.
        result.throughput += thread_throughput(&t.samples);
        result.failures += t.failures;
    }
    for t in threads {
        result.samples.extend(t.samples);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReadMode;
    use byteorder::{ByteOrder, NativeEndian};
    use std::io::{BufRead, BufReader, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::sync::Mutex;

    struct MockServer {
        port: u16,
        requests: Arc<Mutex<Vec<String>>>,
        handle: thread::JoinHandle<()>,
    }

    impl MockServer {
        /// Accepts exactly `conns` connections and answers every line:
        /// SCAN gets a length-prefixed payload, anything else gets "OK".
        fn start(conns: usize, scan_payload: usize) -> MockServer {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let log = requests.clone();
            let handle = thread::spawn(move || {
                let mut workers = Vec::new();
                for _ in 0..conns {
                    let (conn, _) = listener.accept().unwrap();
                    let log = log.clone();
                    workers.push(thread::spawn(move || serve(conn, log, scan_payload)));
                }
                for w in workers {
                    w.join().unwrap();
                }
            });
            MockServer {
                port,
                requests,
                handle,
            }
        }

        fn finish(self) -> Vec<String> {
            self.handle.join().unwrap();
            Arc::try_unwrap(self.requests)
                .unwrap()
                .into_inner()
                .unwrap()
        }
    }

    fn serve(conn: TcpStream, log: Arc<Mutex<Vec<String>>>, scan_payload: usize) {
        let mut writer = conn.try_clone().unwrap();
        let reader = BufReader::new(conn);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            log.lock().unwrap().push(line.clone());
            if line == "SCAN" {
                let mut prefix = [0u8; 8];
                NativeEndian::write_u64(&mut prefix, scan_payload as u64);
                writer.write_all(&prefix).unwrap();
                writer.write_all(&vec![b'x'; scan_payload]).unwrap();
            } else {
                writer.write_all(b"OK\n").unwrap();
            }
        }
    }

    fn config(
        port: u16,
        total: usize,
        threads: usize,
        get_ratio: f64,
        warmup: usize,
    ) -> Arc<BenchConfig> {
        Arc::new(BenchConfig {
            server_addr: Ipv4Addr::LOCALHOST,
            base_port: port,
            total_requests: total,
            connections: 1,
            threads_per_conn: threads,
            core_list: vec![0],
            get_ratio,
            warmup_requests: warmup,
            key_size: 8,
            value_size: 16,
            seed: 1,
            csv: false,
            output: None,
            read_mode: ReadMode::DrainLine,
            connect_policy: ConnectPolicy::Skip,
            timeout_ms: 2000,
            recv_buf: 1024,
        })
    }

    #[test]
    fn single_thread_get_run() {
        let server = MockServer::start(1, 0);
        let cfg = config(server.port, 10, 1, 1.0, 2);

        let result = execute_group(&cfg, 0);
        assert_eq!(result.samples.len(), 10);
        assert_eq!(result.failures, 0);
        assert!(result.throughput > 0.0);

        let requests = server.finish();
        let sets = requests.iter().filter(|r| r.starts_with("SET ")).count();
        let gets = requests.iter().filter(|r| r.starts_with("GET ")).count();
        // 2 warm-up SET/GET pairs plus 10 measured GETs.
        assert_eq!(sets, 2);
        assert_eq!(gets, 12);
        assert!(requests.contains(&"SET key00000 value00000000000".to_string()));
        assert!(requests.contains(&"GET key00009".to_string()));
    }

    #[test]
    fn ratio_zero_sends_only_scans() {
        let server = MockServer::start(1, 300);
        let cfg = config(server.port, 10, 1, 0.0, 0);

        let result = execute_group(&cfg, 0);
        assert_eq!(result.samples.len(), 10);

        let requests = server.finish();
        assert_eq!(requests.len(), 10);
        assert!(requests.iter().all(|r| r == "SCAN"));
    }

    #[test]
    fn siblings_cover_the_same_key_range() {
        let server = MockServer::start(2, 0);
        // 50 requests over 1 connection x 2 threads: 25 per thread.
        let cfg = config(server.port, 50, 2, 1.0, 0);

        let result = execute_group(&cfg, 0);
        assert_eq!(result.samples.len(), 50);

        let requests = server.finish();
        assert_eq!(requests.len(), 50);
        for i in 0..25 {
            let key = format!("GET key{:05}", i);
            let hits = requests.iter().filter(|r| **r == key).count();
            assert_eq!(hits, 2, "key index {} not issued by both siblings", i);
        }
    }

    #[test]
    fn skip_policy_yields_zero_samples_on_connect_failure() {
        // Grab a port and free it again so the connect is refused.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let cfg = config(port, 10, 1, 1.0, 0);

        let result = run_worker(&cfg, 0, None);
        assert!(result.samples.is_empty());
        assert_eq!(result.failures, 0);
    }
}
