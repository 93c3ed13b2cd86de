//! Client `Range:` header parsing (spec.md §4.6.1 step 12), grounded on
//! `original_source/src/job.cc`'s `ParseRange` (single-range byte requests
//! only; multi-range and suffix-length forms are rejected — they never
//! arise from the clients this proxy is meant to serve).

/// A client's requested byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub from: i64,
    pub to: i64,
}

/// Parses `Range: bytes=<from>-<to>`. `to` may be omitted (open-ended); in
/// that case it is resolved against `known_len` when available, or left as
/// `i64::MAX` to mean "until EOF" when the length isn't known yet.
pub fn parse_range(value: &str, known_len: i64) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?;
    // Only a single range is supported; reject the multi-range form.
    if spec.contains(',') {
        return None;
    }
    let (from_s, to_s) = spec.split_once('-')?;

    if from_s.is_empty() {
        // Suffix-length form "bytes=-N": last N bytes. Requires a known length.
        if known_len < 0 {
            return None;
        }
        let suffix: i64 = to_s.parse().ok()?;
        let from = (known_len - suffix).max(0);
        return Some(ByteRange { from, to: known_len - 1 });
    }

    let from: i64 = from_s.parse().ok()?;
    let to = if to_s.is_empty() {
        if known_len >= 0 { known_len - 1 } else { i64::MAX }
    } else {
        to_s.parse().ok()?
    };
    if from < 0 || to < from {
        return None;
    }
    Some(ByteRange { from, to })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_closed_range() {
        assert_eq!(parse_range("bytes=100-199", 1000), Some(ByteRange { from: 100, to: 199 }));
    }

    #[test]
    fn parses_open_ended_range_with_known_length() {
        assert_eq!(parse_range("bytes=100-", 200), Some(ByteRange { from: 100, to: 199 }));
    }

    #[test]
    fn parses_open_ended_range_without_known_length() {
        assert_eq!(parse_range("bytes=100-", -1), Some(ByteRange { from: 100, to: i64::MAX }));
    }

    #[test]
    fn parses_suffix_length_form() {
        assert_eq!(parse_range("bytes=-500", 1000), Some(ByteRange { from: 500, to: 999 }));
    }

    #[test]
    fn rejects_multi_range() {
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), None);
    }

    #[test]
    fn rejects_inverted_range() {
        assert_eq!(parse_range("bytes=500-100", 1000), None);
    }
}
