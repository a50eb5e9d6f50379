use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::net::{BodyResponse, FetchRequest, NetClient, ProbeResponse};

/// Deterministic, non-repeating-looking payload.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub(crate) struct MockResource {
    body: Vec<u8>,
    accept_ranges: bool,
    advertise_length: bool,
    status: u16,
    failing_range: Option<u64>,
    flaky_range: Option<u64>,
    flaky_left: AtomicU32,
    timing_out_range: Option<u64>,
    read_size: usize,
    read_delay: Duration,
}

impl MockResource {
    pub(crate) fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            accept_ranges: true,
            advertise_length: true,
            status: 200,
            failing_range: None,
            flaky_range: None,
            flaky_left: AtomicU32::new(0),
            timing_out_range: None,
            read_size: 64 * 1024,
            read_delay: Duration::ZERO,
        }
    }

    pub(crate) fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub(crate) fn without_length(mut self) -> Self {
        self.accept_ranges = false;
        self.advertise_length = false;
        self
    }

    /// Status for plain (non-ranged) requests, probe included.
    pub(crate) fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Ranged requests starting at `start` answer HTTP 500.
    pub(crate) fn failing_range(mut self, start: u64) -> Self {
        self.failing_range = Some(start);
        self
    }

    /// The first `times` ranged requests starting at `start` break off halfway.
    pub(crate) fn flaky_range(mut self, start: u64, times: u32) -> Self {
        self.flaky_range = Some(start);
        self.flaky_left = AtomicU32::new(times);
        self
    }

    /// Ranged requests starting at `start` stall halfway and the read times out.
    pub(crate) fn timing_out_range(mut self, start: u64) -> Self {
        self.timing_out_range = Some(start);
        self
    }

    pub(crate) fn slow(mut self, read_size: usize, delay: Duration) -> Self {
        self.read_size = read_size.max(1);
        self.read_delay = delay;
        self
    }

    fn reader(&self, data: Vec<u8>, break_after: Option<(usize, io::ErrorKind)>) -> Box<dyn Read + Send> {
        Box::new(MockReader {
            data,
            pos: 0,
            read_size: self.read_size,
            delay: self.read_delay,
            break_after,
        })
    }
}

struct MockReader {
    data: Vec<u8>,
    pos: usize,
    read_size: usize,
    delay: Duration,
    break_after: Option<(usize, io::ErrorKind)>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self
            .break_after
            .map(|(at, _)| at)
            .unwrap_or(self.data.len());
        if self.pos >= limit {
            if let Some((_, kind)) = self.break_after {
                return Err(io::Error::new(kind, "read interrupted"));
            }
            return Ok(0);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let len = buf.len().min(self.read_size).min(limit - self.pos);
        buf[..len].copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }
}

/// In-memory `NetClient` serving registered resources by exact URL.
#[derive(Default)]
pub(crate) struct MockNet {
    resources: Mutex<HashMap<String, Arc<MockResource>>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockNet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn serve(&self, url: &str, resource: MockResource) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::new(resource));
    }

    /// GET requests seen so far, in arrival order.
    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn lookup(&self, url: &str) -> CoreResult<Arc<MockResource>> {
        self.resources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| CoreError::Transfer(format!("{}: connection refused", url)))
    }
}

impl NetClient for MockNet {
    fn head(&self, req: &FetchRequest) -> CoreResult<ProbeResponse> {
        let resource = self.lookup(&req.url)?;
        Ok(ProbeResponse {
            status_code: resource.status,
            total_bytes: resource
                .advertise_length
                .then_some(resource.body.len() as u64),
            accept_ranges: resource.accept_ranges,
        })
    }

    fn get(&self, req: &FetchRequest) -> CoreResult<BodyResponse> {
        self.requests.lock().unwrap().push(req.clone());
        let resource = self.lookup(&req.url)?;
        let total = resource.body.len() as u64;

        match req.range {
            Some((start, end)) if resource.accept_ranges => {
                if resource.failing_range == Some(start) {
                    return Ok(BodyResponse {
                        status_code: 500,
                        content_length: Some(0),
                        body: resource.reader(Vec::new(), None),
                    });
                }
                let end = end.min(total.saturating_sub(1));
                let data = resource.body[start as usize..=end as usize].to_vec();
                let mut break_after = None;
                if resource.flaky_range == Some(start)
                    && resource
                        .flaky_left
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                            left.checked_sub(1)
                        })
                        .is_ok()
                {
                    break_after = Some((data.len() / 2, io::ErrorKind::ConnectionReset));
                }
                if resource.timing_out_range == Some(start) {
                    break_after = Some((data.len() / 2, io::ErrorKind::TimedOut));
                }
                Ok(BodyResponse {
                    status_code: 206,
                    content_length: Some(data.len() as u64),
                    body: resource.reader(data, break_after),
                })
            }
            _ => {
                if resource.status != 200 {
                    return Ok(BodyResponse {
                        status_code: resource.status,
                        content_length: Some(0),
                        body: resource.reader(Vec::new(), None),
                    });
                }
                Ok(BodyResponse {
                    status_code: 200,
                    content_length: resource.advertise_length.then_some(total),
                    body: resource.reader(resource.body.clone(), None),
                })
            }
        }
    }
}
