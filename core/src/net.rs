use std::error::Error;
use std::io::{self, Read};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, RANGE};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Inclusive byte range.
    pub range: Option<(u64, u64)>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range: None,
        }
    }

    pub fn ranged(url: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            url: url.into(),
            range: Some((start, end)),
        }
    }

    pub fn range_header(&self) -> Option<String> {
        self.range
            .map(|(start, end)| format!("bytes={}-{}", start, end))
    }
}

/// Metadata returned by the capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub accept_ranges: bool,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// A response whose body is streamed by the caller.
pub struct BodyResponse {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl BodyResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub trait NetClient: Send + Sync {
    fn head(&self, req: &FetchRequest) -> CoreResult<ProbeResponse>;
    fn get(&self, req: &FetchRequest) -> CoreResult<BodyResponse>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(user_agent: &str, timeout: Duration) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|err| CoreError::Transfer(err.to_string()))?;
        Ok(Self { client })
    }
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &FetchRequest) -> CoreResult<ProbeResponse> {
        let resp = self
            .client
            .head(&req.url)
            .send()
            .map_err(|err| map_reqwest_error(&req.url, err))?;
        let headers = resp.headers();
        let total_bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(ProbeResponse {
            status_code: resp.status().as_u16(),
            total_bytes,
            accept_ranges,
        })
    }

    fn get(&self, req: &FetchRequest) -> CoreResult<BodyResponse> {
        let mut request = self.client.get(&req.url);
        if let Some(range) = req.range_header() {
            let value = HeaderValue::from_str(&range)
                .map_err(|err| CoreError::Transfer(err.to_string()))?;
            request = request.header(RANGE, value);
        }
        let resp = request
            .send()
            .map_err(|err| map_reqwest_error(&req.url, err))?;
        Ok(BodyResponse {
            status_code: resp.status().as_u16(),
            content_length: resp.content_length(),
            body: Box::new(resp),
        })
    }
}

fn map_reqwest_error(url: &str, err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        CoreError::Timeout(format!("{}: {}", url, err))
    } else {
        CoreError::Transfer(format!("{}: {}", url, err))
    }
}

/// Maps a body read failure. Blocking reqwest wraps a stalled read in an io
/// error carrying a `reqwest::Error`, so the source chain is checked too.
pub(crate) fn map_read_error(err: io::Error) -> CoreError {
    if is_timeout(&err) {
        CoreError::Timeout(err.to_string())
    } else {
        CoreError::Transfer(err.to_string())
    }
}

fn is_timeout(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::TimedOut {
        return true;
    }
    let Some(inner) = err.get_ref() else {
        return false;
    };
    if let Some(reqwest_err) = inner.downcast_ref::<reqwest::Error>() {
        if reqwest_err.is_timeout() {
            return true;
        }
    }
    let mut source = Some(inner as &(dyn Error + 'static));
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = current.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Decode(io::Error);

    impl fmt::Display for Decode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("error decoding response body")
        }
    }

    impl Error for Decode {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(
            FetchRequest::ranged("http://a/b", 500, 999).range_header().as_deref(),
            Some("bytes=500-999")
        );
        assert_eq!(FetchRequest::new("http://a/b").range_header(), None);
    }

    #[test]
    fn timed_out_reads_map_to_timeout() {
        let direct = io::Error::new(io::ErrorKind::TimedOut, "read timed out");
        assert!(matches!(map_read_error(direct), CoreError::Timeout(_)));

        let wrapped = io::Error::new(
            io::ErrorKind::Other,
            Decode(io::Error::new(io::ErrorKind::TimedOut, "operation timed out")),
        );
        assert!(matches!(map_read_error(wrapped), CoreError::Timeout(_)));
    }

    #[test]
    fn other_read_failures_stay_transfer_errors() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        assert!(matches!(map_read_error(reset), CoreError::Transfer(_)));

        let wrapped = io::Error::new(
            io::ErrorKind::Other,
            Decode(io::Error::new(io::ErrorKind::UnexpectedEof, "eof")),
        );
        assert!(matches!(map_read_error(wrapped), CoreError::Transfer(_)));
    }
}
