use std::time::Duration;

use reqwest::{blocking::Client, header::DATE};
use thiserror::Error;
use time::{macros::format_description, PrimitiveDateTime};

pub const DEFAULT_TIME_URL: &str = "https://clients3.google.com/generate_204";
pub const DEFAULT_TIME_TIMEOUT: Duration = Duration::from_secs(5);

/// Trusted time could not be obtained. The cause is kept for logs only.
#[derive(Debug, Clone, Error)]
#[error("network time unavailable: {reason}")]
pub struct TimeUnavailable {
    reason: String,
}

impl TimeUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Source of wall-clock time that the user cannot move.
pub trait NetworkTimeSource: Send + Sync {
    fn now_ms(&self) -> Result<i64, TimeUnavailable>;
}

/// Reads the `Date` header of a lightweight `HEAD` request.
#[derive(Debug, Clone)]
pub struct HttpDateTimeSource {
    url: String,
    timeout: Duration,
}

impl Default for HttpDateTimeSource {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_URL, DEFAULT_TIME_TIMEOUT)
    }
}

impl HttpDateTimeSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

impl NetworkTimeSource for HttpDateTimeSource {
    fn now_ms(&self) -> Result<i64, TimeUnavailable> {
        let client = Client::builder()
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .build()
            .map_err(|err| TimeUnavailable::new(err.to_string()))?;
        tracing::debug!(url = %self.url, "HTTP request: HEAD");
        let response = client
            .head(&self.url)
            .send()
            .map_err(|err| TimeUnavailable::new(err.to_string()))?;
        let status = response.status();
        tracing::debug!(%status, "HTTP response");
        if !status.is_success() {
            return Err(TimeUnavailable::new(format!("HTTP {status}")));
        }
        let header = response
            .headers()
            .get(DATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| TimeUnavailable::new("missing Date header"))?;
        parse_http_date(header)
            .ok_or_else(|| TimeUnavailable::new(format!("unparseable Date header {header:?}")))
    }
}

/// Parses an RFC 1123 date (`Mon, 13 Oct 2025 00:00:00 GMT`) into epoch millis.
pub(crate) fn parse_http_date(value: &str) -> Option<i64> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    let parsed = PrimitiveDateTime::parse(value.trim(), format).ok()?;
    Some(parsed.assume_utc().unix_timestamp() * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc1123_dates() {
        assert_eq!(
            parse_http_date("Mon, 13 Oct 2025 00:00:00 GMT"),
            Some(1_760_313_600_000)
        );
        assert_eq!(
            parse_http_date(" Thu, 16 Oct 2025 06:30:00 GMT "),
            Some(1_760_596_200_000)
        );
    }

    #[test]
    fn rejects_other_date_shapes() {
        assert_eq!(parse_http_date("2025-10-13T00:00:00Z"), None);
        assert_eq!(parse_http_date("Mon, 13 Oct 2025 00:00:00 PST"), None);
        assert_eq!(parse_http_date(""), None);
    }

    #[test]
    fn unavailable_message_carries_reason() {
        let error = TimeUnavailable::new("missing Date header");
        assert_eq!(
            error.to_string(),
            "network time unavailable: missing Date header"
        );
    }
}
