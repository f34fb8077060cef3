//! Byte-range requests (`Range: bytes=...`) resolved against a known body
//! length.

/// Ranges beyond this count make the header ignored.
const MAX_RANGES: usize = 32;

/// Half-open byte range `[begin, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustedByteRange {
    begin: u64,
    end: u64,
}

impl AdjustedByteRange {
    pub fn new(begin: u64, end: u64) -> Self {
        debug_assert!(begin <= end, "range begin {begin} past end {end}");
        Self {
            begin,
            end: end.max(begin),
        }
    }

    /// The whole body: `[0, len)`, or unbounded if the length is unknown.
    pub fn whole(content_length: Option<u64>) -> Self {
        Self::new(0, content_length.unwrap_or(u64::MAX))
    }

    #[inline]
    pub fn begin(&self) -> u64 {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_unbounded(&self) -> bool {
        self.end == u64::MAX
    }

    /// Drop `n` bytes from the front.
    pub fn trim_front(&mut self, n: u64) {
        debug_assert!(n <= self.length(), "trim of {n} exceeds range length");
        self.begin = self.begin.saturating_add(n).min(self.end);
    }
}

/// One byte-range spec as written by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawByteRange {
    /// `first-last`, inclusive.
    Bounded { first: u64, last: u64 },
    /// `first-`
    From(u64),
    /// `-n`: the last `n` bytes.
    Suffix(u64),
}

/// Parse a `Range` header. Anything malformed, any unit other than `bytes`,
/// or more than 32 ranges yields `None`, meaning the header is ignored.
pub fn parse_range_header(value: &str) -> Option<Vec<RawByteRange>> {
    let (unit, specs) = value.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }

    let mut ranges = Vec::new();
    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let (first, last) = spec.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());
        let range = match (first.is_empty(), last.is_empty()) {
            (true, true) => return None,
            (true, false) => RawByteRange::Suffix(last.parse().ok()?),
            (false, true) => RawByteRange::From(first.parse().ok()?),
            (false, false) => {
                let first: u64 = first.parse().ok()?;
                let last: u64 = last.parse().ok()?;
                if last < first {
                    return None;
                }
                RawByteRange::Bounded { first, last }
            }
        };
        ranges.push(range);
        if ranges.len() > MAX_RANGES {
            return None;
        }
    }

    if ranges.is_empty() {
        None
    } else {
        Some(ranges)
    }
}

/// Requested ranges adjusted to a body of known length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeDetails {
    /// `false` when no requested range overlaps the body (416).
    pub satisfiable: bool,
    pub ranges: Vec<AdjustedByteRange>,
}

impl RangeDetails {
    pub fn new(raw: &[RawByteRange], content_length: u64) -> Self {
        let ranges: Vec<AdjustedByteRange> = raw
            .iter()
            .filter_map(|r| match *r {
                RawByteRange::Suffix(0) => None,
                RawByteRange::Suffix(n) => Some(AdjustedByteRange::new(
                    content_length.saturating_sub(n),
                    content_length,
                )),
                RawByteRange::From(first) if first < content_length => {
                    Some(AdjustedByteRange::new(first, content_length))
                }
                RawByteRange::Bounded { first, last } if first < content_length => Some(
                    AdjustedByteRange::new(first, last.saturating_add(1).min(content_length)),
                ),
                _ => None,
            })
            .filter(|r| r.length() > 0)
            .collect();

        Self {
            satisfiable: !ranges.is_empty(),
            ranges,
        }
    }

    /// Parse `header` and adjust it to `content_length`.
    pub fn from_header(header: &str, content_length: u64) -> Option<Self> {
        parse_range_header(header).map(|raw| Self::new(&raw, content_length))
    }
}
