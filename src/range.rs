#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// Parse a `Content-Range: bytes a-b/total` value. The total may be `*`.
pub fn parse_content_range(header: &str) -> Option<ContentRange> {
    let header = header.trim();
    let rest = header.strip_prefix("bytes")?.trim_start();
    let (range_part, size_part) = rest.split_once('/')?;
    let (start_str, end_str) = range_part.split_once('-')?;
    let start: u64 = start_str.trim().parse().ok()?;
    let end: u64 = end_str.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match size_part.trim() {
        "*" => None,
        s => Some(s.parse::<u64>().ok()?),
    };
    Some(ContentRange { start, end, total })
}

/// Extract just the `/total` part, tolerating an unparseable range part.
/// Servers occasionally send `bytes */N` for 416 responses.
pub fn parse_content_range_total(header: &str) -> Option<u64> {
    let header = header.trim();
    let rest = header.strip_prefix("bytes")?;
    let (_, size_part) = rest.split_once('/')?;
    size_part.trim().parse::<u64>().ok()
}

pub fn format_range(start: u64, end: u64) -> String {
    format!("bytes={}-{}", start, end)
}

/// Round an offset down to the chunk grid.
pub fn align_down(offset: u64, chunk_size: u64) -> u64 {
    (offset / chunk_size) * chunk_size
}

pub fn round_up(value: u64, chunk_size: u64) -> u64 {
    value.div_ceil(chunk_size) * chunk_size
}

/// Number of chunks needed so that a download starting at `aligned_start`
/// covers everything up to `end_offset` (exclusive).
pub fn min_blocks(aligned_start: u64, end_offset: u64, chunk_size: u64) -> u64 {
    round_up(end_offset - aligned_start, chunk_size) / chunk_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_content_range() {
        let cr = parse_content_range("bytes 0-499/1234").unwrap();
        assert_eq!(cr.start, 0);
        assert_eq!(cr.end, 499);
        assert_eq!(cr.total, Some(1234));
    }

    #[test]
    fn parses_unknown_total() {
        let cr = parse_content_range("bytes 100-199/*").unwrap();
        assert_eq!(cr.total, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_content_range("items 0-1/2").is_none());
        assert!(parse_content_range("bytes 5-1/10").is_none());
        assert!(parse_content_range("bytes x-y/z").is_none());
        // u64 overflow must not wrap
        assert!(parse_content_range("bytes 0-1/99999999999999999999999999").is_none());
    }

    #[test]
    fn total_only_parse_accepts_star_range() {
        assert_eq!(parse_content_range_total("bytes */4096"), Some(4096));
        assert_eq!(parse_content_range_total("bytes 0-99/4096"), Some(4096));
        assert_eq!(parse_content_range_total("bytes */*"), None);
    }

    #[test]
    fn chunk_math() {
        assert_eq!(align_down(0, 16384), 0);
        assert_eq!(align_down(16383, 16384), 0);
        assert_eq!(align_down(16384, 16384), 16384);
        assert_eq!(round_up(1, 16384), 16384);
        assert_eq!(round_up(16384, 16384), 16384);
        assert_eq!(min_blocks(0, 1, 16384), 1);
        assert_eq!(min_blocks(0, 16385, 16384), 2);
        assert_eq!(min_blocks(16384, 16384 + 2, 16384), 1);
    }

    #[test]
    fn range_header_format() {
        assert_eq!(format_range(0, 16383), "bytes=0-16383");
    }
}
