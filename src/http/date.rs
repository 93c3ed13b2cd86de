//! `HttpDate`: a thin wrapper over the `httpdate` crate giving HTTP-date
//! values value semantics and the comparisons the file-item and client job
//! need (equality for "unchanged" checks, ordering for `If-Modified-Since`).
//!
//! Grounded on `original_source/src/httpdate.h`'s `tHttpDate`: lazily-parsed,
//! round-trips through `SystemTime`, compares by value not by string.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpDate(Option<u64>);

impl HttpDate {
    pub fn unset() -> Self {
        HttpDate(None)
    }

    pub fn from_unix(secs: u64) -> Self {
        HttpDate(Some(secs))
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_secs();
        HttpDate(Some(secs))
    }

    pub fn parse(s: &str) -> Option<Self> {
        httpdate::parse_http_date(s)
            .ok()
            .map(Self::from_system_time)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn unix_secs(&self) -> Option<u64> {
        self.0
    }

    pub fn format(&self) -> Option<String> {
        self.0
            .map(|s| httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(s)))
    }
}

impl Default for HttpDate {
    fn default() -> Self {
        Self::unset()
    }
}
