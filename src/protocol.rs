use std::io::{self, Error, ErrorKind, Read, Write};
use std::net::{SocketAddrV4, TcpStream};
use std::str::FromStr;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, NativeEndian};

const SCAN_COMMAND: &[u8] = b"SCAN\n";
const SCAN_PREFIX_BYTES: usize = 8;

/// How GET/SET replies are drained off the socket.
///
/// `SingleRead` reproduces the historical behavior: exactly one read into
/// the fixed buffer, assumed to cover the whole reply. A reply fragmented
/// across TCP segments leaves bytes behind and understates latency; that
/// inaccuracy is part of the mode's contract. `DrainLine` reads until a
/// newline has been seen and is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    SingleRead,
    DrainLine,
}

impl FromStr for ReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single-read" => Ok(ReadMode::SingleRead),
            "drain-line" => Ok(ReadMode::DrainLine),
            _ => Err(format!("Unknown read mode: {}", s)),
        }
    }
}

pub fn set_command(key: &str, value: &str) -> Vec<u8> {
    format!("SET {} {}\n", key, value).into_bytes()
}

pub fn get_command(key: &str) -> Vec<u8> {
    format!("GET {}\n", key).into_bytes()
}

/// One synchronous connection to the benchmarked server. Owned exclusively
/// by a single worker thread; never shared.
pub struct KvClient {
    stream: TcpStream,
    recv_buf: Vec<u8>,
    read_mode: ReadMode,
}

impl KvClient {
    pub fn connect(
        addr: SocketAddrV4,
        read_mode: ReadMode,
        recv_buf: usize,
        timeout_ms: u64,
    ) -> io::Result<KvClient> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        if timeout_ms > 0 {
            stream.set_read_timeout(Some(Duration::from_millis(timeout_ms)))?;
        }
        Ok(KvClient {
            stream,
            recv_buf: vec![0; recv_buf],
            read_mode,
        })
    }

    /// Issue one GET/SET command and time the reply drain in microseconds.
    pub fn send_and_measure(&mut self, command: &[u8]) -> io::Result<u64> {
        self.stream.write_all(command)?;
        let start = Instant::now();
        self.drain_reply()?;
        Ok(start.elapsed().as_micros() as u64)
    }

    /// Issue one SCAN and time draining the length-prefixed reply stream.
    ///
    /// The reply starts with an 8-byte unsigned length in host byte order;
    /// exactly that many payload bytes follow, possibly over several
    /// segments. A zero-byte read mid-drain means the peer closed the
    /// connection and is an error, never something to spin on.
    pub fn send_and_measure_scan(&mut self) -> io::Result<u64> {
        self.stream.write_all(SCAN_COMMAND)?;
        let start = Instant::now();

        let mut prefix = [0u8; SCAN_PREFIX_BYTES];
        self.stream.read_exact(&mut prefix)?;
        let mut remaining = NativeEndian::read_u64(&prefix);

        while remaining > 0 {
            let want = remaining.min(self.recv_buf.len() as u64) as usize;
            let n = self.stream.read(&mut self.recv_buf[..want])?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("scan reply truncated with {} bytes outstanding", remaining),
                ));
            }
            remaining -= n as u64;
        }
        Ok(start.elapsed().as_micros() as u64)
    }

    /// Warm-up path: same write as a measured request, reply drained into
    /// the scratch buffer, nothing recorded.
    pub fn warmup(&mut self, command: &[u8]) -> io::Result<()> {
        self.stream.write_all(command)?;
        self.drain_reply()
    }

    fn drain_reply(&mut self) -> io::Result<()> {
        loop {
            let n = self.stream.read(&mut self.recv_buf)?;
            if n == 0 {
                return Err(Error::new(ErrorKind::UnexpectedEof, "server closed connection"));
            }
            match self.read_mode {
                ReadMode::SingleRead => return Ok(()),
                ReadMode::DrainLine => {
                    if self.recv_buf[..n].contains(&b'\n') {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// True when the connection is unusable and the worker should stop issuing
/// requests on it. Timeouts are not fatal; they count as a per-request
/// failure and the loop moves on.
///
/// After a timeout the overdue reply is still in flight. It stays on the
/// socket and satisfies the next request's drain, so from that point every
/// sample on the connection can be shifted by one reply. Continuing anyway
/// keeps the load pattern intact, like the other measurement quirks; the
/// failure count is the signal that samples after it are suspect.
pub fn is_fatal(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(libc::ECONNRESET) | Some(libc::ECONNABORTED) | Some(libc::EPIPE) => return true,
        _ => {}
    }
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
