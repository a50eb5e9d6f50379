//! Tiny HTTP/1.1 server for integration tests.
//!
//! Serves one body at every path. Answers HEAD with `Content-Length` (and
//! `Accept-Ranges: bytes` when ranges are on) and ranged GETs with 206. Every
//! response closes the connection.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const STALL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub ranges: bool,
    /// Ranged GETs starting at this offset answer 500.
    pub fail_range_start: Option<u64>,
    /// Ranged GETs send this many body bytes, then hold the connection silent.
    pub stall_after: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ranges: true,
            fail_range_start: None,
            stall_after: None,
        }
    }
}

pub struct RangeServer {
    base: String,
    ranged_gets: Arc<AtomicUsize>,
    plain_gets: Arc<AtomicUsize>,
}

impl RangeServer {
    pub fn start(body: Vec<u8>) -> Self {
        Self::start_with(body, ServerOptions::default())
    }

    pub fn start_with(body: Vec<u8>, options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let body = Arc::new(body);
        let ranged_gets = Arc::new(AtomicUsize::new(0));
        let plain_gets = Arc::new(AtomicUsize::new(0));
        let counters = (Arc::clone(&ranged_gets), Arc::clone(&plain_gets));
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let body = Arc::clone(&body);
                let counters = (Arc::clone(&counters.0), Arc::clone(&counters.1));
                thread::spawn(move || serve(stream, &body, options, counters));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{}", port),
            ranged_gets,
            plain_gets,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn ranged_gets(&self) -> usize {
        self.ranged_gets.load(Ordering::SeqCst)
    }

    pub fn plain_gets(&self) -> usize {
        self.plain_gets.load(Ordering::SeqCst)
    }
}

fn serve(
    mut stream: TcpStream,
    body: &[u8],
    options: ServerOptions,
    (ranged_gets, plain_gets): (Arc<AtomicUsize>, Arc<AtomicUsize>),
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let Some(head) = read_head(&mut stream) else {
        return;
    };
    let (method, range) = parse_head(&head);
    let total = body.len() as u64;
    let accept = if options.ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };

    if method == "HEAD" {
        let _ = write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
            total, accept
        );
        return;
    }
    if method != "GET" {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }

    match range.filter(|_| options.ranges) {
        Some((start, _)) if options.fail_range_start == Some(start) => {
            ranged_gets.fetch_add(1, Ordering::SeqCst);
            let _ = stream.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
        }
        Some((start, end)) => {
            ranged_gets.fetch_add(1, Ordering::SeqCst);
            let end = end.min(total.saturating_sub(1));
            if start > end {
                let _ = write!(
                    stream,
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    total
                );
                return;
            }
            let slice = &body[start as usize..=end as usize];
            let _ = write!(
                stream,
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\n{}Connection: close\r\n\r\n",
                slice.len(),
                start,
                end,
                total,
                accept
            );
            match options.stall_after {
                Some(sent) => {
                    let _ = stream.write_all(&slice[..sent.min(slice.len())]);
                    let _ = stream.flush();
                    thread::sleep(STALL);
                }
                None => {
                    let _ = stream.write_all(slice);
                }
            }
        }
        None => {
            plain_gets.fetch_add(1, Ordering::SeqCst);
            let _ = write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
                total, accept
            );
            let _ = stream.write_all(body);
        }
    }
}

fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buf).ok()?;
        if read == 0 {
            return None;
        }
        head.extend_from_slice(&buf[..read]);
    }
    String::from_utf8(head).ok()
}

/// Method and inclusive `bytes=a-b` range.
fn parse_head(head: &str) -> (String, Option<(u64, u64)>) {
    let mut lines = head.lines();
    let method = lines
        .next()
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or("")
        .to_ascii_uppercase();
    let range = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .and_then(|(_, value)| value.trim().strip_prefix("bytes="))
        .and_then(|spec| spec.split_once('-'))
        .and_then(|(start, end)| {
            let start = start.trim().parse::<u64>().ok()?;
            let end = match end.trim() {
                "" => u64::MAX,
                end => end.parse::<u64>().ok()?,
            };
            Some((start, end))
        });
    (method, range)
}
