//! Readiness detection for the dev server
//!
//! The dev server announces that it is listening by printing a banner
//! (e.g. `VITE v5.0.0  ready in 120 ms`). A background task scans the child's
//! combined output for configured substrings and fires a [`ReadinessSignal`]
//! on the first match. This is a textual heuristic: the port may not accept
//! connections yet at the moment the banner is printed. An optional HTTP
//! probe can feed the same signal.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Interval between HTTP readiness probes
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);

const PENDING: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Outcome observed on a [`ReadinessSignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Nothing decided yet
    Pending,
    /// A readiness pattern matched (or the probe succeeded)
    Ready,
    /// The output stream ended or the attempt was cancelled before readiness
    Closed,
}

/// Single-fire latch shared between the log reader and the starter.
///
/// The first call to [`fire`](Self::fire) or [`close`](Self::close) wins;
/// later calls are no-ops. A fresh signal is created for every start attempt.
#[derive(Debug)]
pub struct ReadinessSignal {
    state: AtomicU8,
    notify: Notify,
}

impl ReadinessSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            notify: Notify::new(),
        })
    }

    /// Mark the dev server ready. Returns true if this call settled the latch.
    pub fn fire(&self) -> bool {
        self.settle(READY)
    }

    /// Settle the latch without readiness. Returns true if this call settled it.
    pub fn close(&self) -> bool {
        self.settle(CLOSED)
    }

    fn settle(&self, to: u8) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    pub fn get(&self) -> Readiness {
        match self.state.load(Ordering::Acquire) {
            READY => Readiness::Ready,
            CLOSED => Readiness::Closed,
            _ => Readiness::Pending,
        }
    }

    /// Wait until the latch settles and return the outcome
    pub async fn wait(&self) -> Readiness {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent settle cannot be missed
            notified.as_mut().enable();

            let state = self.get();
            if state != Readiness::Pending {
                return state;
            }
            notified.await;
        }
    }
}

/// Remove ANSI escape sequences (colors, cursor movement, hyperlinks)
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            // CSI: parameters and intermediates up to a final byte in @..~
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: terminated by BEL or ESC \
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }

    out
}

/// Case-sensitive substring match of a cleaned line against the patterns
pub fn matches_readiness(line: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && line.contains(pattern.as_str()))
}

/// Spawn the task that owns the child's output for its whole lifetime.
///
/// Both pipes are drained concurrently into a single line stream. Every
/// line is logged; the first readiness match fires `signal`. When both pipes
/// reach EOF the signal is closed, which is a no-op if it already fired.
pub fn spawn_log_reader<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    patterns: Vec<String>,
    signal: Arc<ReadinessSignal>,
) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        tokio::join!(
            scan_stream(stdout, "stdout", &patterns, &signal),
            scan_stream(stderr, "stderr", &patterns, &signal),
        );
        if signal.close() {
            debug!("Dev server output closed before readiness");
        } else {
            debug!("Dev server output closed");
        }
    })
}

async fn scan_stream<R>(
    stream: Option<R>,
    name: &'static str,
    patterns: &[String],
    signal: &ReadinessSignal,
) where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };

    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let line = strip_ansi(raw.trim_end_matches(['\r', '\n']));
                if line.trim().is_empty() {
                    continue;
                }

                info!(target: "devgate::dev_server", stream = name, "{}", line);

                if signal.get() == Readiness::Pending
                    && matches_readiness(&line, patterns)
                    && signal.fire()
                {
                    info!(line = %line, "Dev server readiness pattern matched");
                }
            }
            Err(e) => {
                debug!(stream = name, error = %e, "Dev server log reader closed");
                break;
            }
        }
    }
}

/// Spawn a task that probes `GET /` until the signal settles.
///
/// A 200 or 404 answer means something is serving HTTP on the port.
pub fn spawn_http_probe(
    host: String,
    port: u16,
    signal: Arc<ReadinessSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while signal.get() == Readiness::Pending {
            if probe_http(&host, port).await {
                if signal.fire() {
                    info!(host = %host, port, "Dev server answered HTTP readiness probe");
                }
                return;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    })
}

/// Issue a raw `GET /` and report whether the status is 200 or 404
pub async fn probe_http(host: &str, port: u16) -> bool {
    let connect_result = tokio::time::timeout(
        Duration::from_secs(1),
        TcpStream::connect((host, port)),
    )
    .await;

    let mut stream = match connect_result {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n\r\n",
        host, port
    );

    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(Duration::from_secs(1), async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| code == 200 || code == 404)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn patterns() -> Vec<String> {
        vec!["ready in".to_string(), "Local:".to_string()]
    }

    #[test]
    fn test_strip_ansi_colors() {
        let line = "\x1b[32m\x1b[1mVITE\x1b[22m v5.0.0\x1b[39m  \x1b[2mready in \x1b[0m\x1b[1m120\x1b[22m ms";
        assert_eq!(strip_ansi(line), "VITE v5.0.0  ready in 120 ms");
    }

    #[test]
    fn test_strip_ansi_osc_hyperlink() {
        let line = "\x1b]8;;http://localhost:5173/\x07http://localhost:5173/\x1b]8;;\x1b\\";
        assert_eq!(strip_ansi(line), "http://localhost:5173/");
    }

    #[test]
    fn test_strip_ansi_plain_text_untouched() {
        assert_eq!(strip_ansi("plain line"), "plain line");
        assert_eq!(strip_ansi(""), "");
        assert_eq!(strip_ansi("trailing escape \x1b"), "trailing escape ");
    }

    #[test]
    fn test_matches_readiness_is_case_sensitive() {
        assert!(matches_readiness("  VITE v5  ready in 88 ms", &patterns()));
        assert!(matches_readiness("  ➜  Local:   http://localhost:5173/", &patterns()));
        assert!(!matches_readiness("READY IN 88 ms", &patterns()));
        assert!(!matches_readiness("compiling...", &patterns()));
    }

    #[test]
    fn test_empty_pattern_never_matches() {
        assert!(!matches_readiness("anything", &["".to_string()]));
    }

    #[test]
    fn test_signal_first_writer_wins() {
        let signal = ReadinessSignal::new();
        assert_eq!(signal.get(), Readiness::Pending);

        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(!signal.close());
        assert_eq!(signal.get(), Readiness::Ready);

        let signal = ReadinessSignal::new();
        assert!(signal.close());
        assert!(!signal.fire());
        assert_eq!(signal.get(), Readiness::Closed);
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let signal = ReadinessSignal::new();
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.fire();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_settled() {
        let signal = ReadinessSignal::new();
        signal.close();
        assert_eq!(signal.wait().await, Readiness::Closed);
    }

    #[tokio::test]
    async fn test_log_reader_fires_on_match() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let signal = ReadinessSignal::new();
        let handle = spawn_log_reader(
            Some(reader),
            None::<tokio::io::DuplexStream>,
            patterns(),
            Arc::clone(&signal),
        );

        writer.write_all(b"> vite\n").await.unwrap();
        writer
            .write_all(b"\x1b[32mVITE\x1b[39m ready in \x1b[1m120\x1b[22m ms\n")
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert_eq!(outcome, Readiness::Ready);

        // EOF after readiness leaves the signal fired
        drop(writer);
        handle.await.unwrap();
        assert_eq!(signal.get(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_log_reader_matches_stderr() {
        let (mut err_writer, err_reader) = tokio::io::duplex(1024);
        let (out_writer, out_reader) = tokio::io::duplex(1024);
        let signal = ReadinessSignal::new();
        spawn_log_reader(
            Some(out_reader),
            Some(err_reader),
            patterns(),
            Arc::clone(&signal),
        );

        err_writer.write_all(b"  Local: http://localhost:5173/\n").await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert_eq!(outcome, Readiness::Ready);
        drop(out_writer);
    }

    #[tokio::test]
    async fn test_log_reader_closes_on_eof_without_match() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let signal = ReadinessSignal::new();
        let handle = spawn_log_reader(
            Some(reader),
            None::<tokio::io::DuplexStream>,
            patterns(),
            Arc::clone(&signal),
        );

        writer.write_all(b"npm ERR! missing script: dev\n").await.unwrap();
        drop(writer);
        handle.await.unwrap();

        assert_eq!(signal.get(), Readiness::Closed);
    }

    #[tokio::test]
    async fn test_log_reader_tolerates_invalid_utf8() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let signal = ReadinessSignal::new();
        spawn_log_reader(
            Some(reader),
            None::<tokio::io::DuplexStream>,
            patterns(),
            Arc::clone(&signal),
        );

        writer.write_all(b"\xff\xfe garbage\n").await.unwrap();
        writer.write_all(b"ready in 3ms\n").await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert_eq!(outcome, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_probe_http_accepts_404() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        assert!(probe_http("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_probe_http_rejects_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        assert!(!probe_http("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_probe_http_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!probe_http("127.0.0.1", port).await);
    }
}
