//! `Range` header resolution against an authoritative resource size.
//!
//! Only the first range of a multi-range header is honored. Absent or
//! unparseable headers resolve to the whole resource, which this gateway still
//! answers with `206 Partial Content`.

use thiserror::Error;

/// Inclusive byte window `[start, end]` with `start <= end < size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    pub end: u64,
}

impl ByteWindow {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a satisfied request.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RangeError {
    #[error("Range not satisfiable for size {size}")]
    NotSatisfiable { size: u64 },
}

impl RangeError {
    /// `Content-Range` value accompanying a 416.
    pub fn content_range(&self) -> String {
        match self {
            RangeError::NotSatisfiable { size } => format!("bytes */{size}"),
        }
    }
}

enum RangeSpec {
    From { start: u64, end: Option<u64> },
    Suffix(u64),
}

/// Resolve a raw `Range` header value into a concrete window.
pub fn resolve_window(header: Option<&str>, size: u64) -> Result<ByteWindow, RangeError> {
    let unsatisfiable = RangeError::NotSatisfiable { size };
    if size == 0 {
        return Err(unsatisfiable);
    }
    let last = size - 1;

    let window = match header.and_then(parse_first_range) {
        None => ByteWindow { start: 0, end: last },
        Some(RangeSpec::Suffix(0)) => return Err(unsatisfiable),
        Some(RangeSpec::Suffix(n)) => ByteWindow {
            start: size.saturating_sub(n),
            end: last,
        },
        Some(RangeSpec::From { start, .. }) if start >= size => return Err(unsatisfiable),
        Some(RangeSpec::From { start, end }) => ByteWindow {
            start,
            end: end.unwrap_or(last).min(last),
        },
    };

    Ok(window)
}

fn parse_first_range(header: &str) -> Option<RangeSpec> {
    let (unit, ranges) = header.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }

    let first = ranges.split(',').next()?.trim();

    if let Some(suffix) = first.strip_prefix('-') {
        // Suffix length is the leading run of digits
        let digits_len = suffix.bytes().take_while(u8::is_ascii_digit).count();
        if digits_len == 0 {
            return None;
        }
        return suffix[..digits_len].parse().ok().map(RangeSpec::Suffix);
    }

    let (start, end) = first.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().ok()?),
    };

    if let Some(end) = end
        && end < start
    {
        return None;
    }

    Some(RangeSpec::From { start, end })
}
