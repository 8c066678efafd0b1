//! Incremental HTTP/1.1 request-line recognizer and URI classifier.
//!
//! A two-phase scanner that never backtracks and never rescans bytes it has
//! already scanned, even when a `\r\n` straddles two reads.

const GET: &[u8] = b"GET ";
const CRLF: &[u8] = b"\r\n";
const URI_FAST: &[u8] = b"/test/fast";
const URI_SLOW: &[u8] = b"/test/slow";

/// Result of feeding another chunk of bytes to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The request is malformed or of an unsupported method/URI; drop the
    /// connection without a response.
    Terminate,
    /// Need more bytes before a decision can be made.
    Continue,
    /// The request line and header block are complete; `service` holds the
    /// classification.
    Proceed,
}

/// Which of the two service classes a request was classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// Not yet determined.
    Undefined,
    /// `/test/fast` — answered inline on the reactor thread.
    Fast,
    /// `/test/slow` — offloaded to a worker.
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CheckMethod,
    FindCrlf,
}

/// Incremental parser bound to a connection's receive buffer.
///
/// Does not hold a reference to the buffer between calls — `advance`
/// borrows the already-received prefix for the duration of one call only,
/// which keeps `ConnectionContext` (the buffer's owner) from having to
/// become a self-referential struct.
#[derive(Debug)]
pub struct RequestParser {
    phase: Phase,
    crlf_scan: usize,
    prev_crlf: Option<usize>,
    method_ok: bool,
    requestline_size: usize,
    uri_start: usize,
    uri_size: usize,
    /// Classification once `advance` returns [`ParseStatus::Proceed`].
    pub service: Service,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    /// Creates a parser with no bytes yet consumed.
    pub fn new() -> Self {
        RequestParser {
            phase: Phase::CheckMethod,
            crlf_scan: 0,
            prev_crlf: None,
            method_ok: false,
            requestline_size: 0,
            uri_start: 0,
            uri_size: 0,
            service: Service::Undefined,
        }
    }

    /// Size in bytes of the request line (method through version), valid
    /// once classification has succeeded.
    pub fn requestline_size(&self) -> usize {
        self.requestline_size
    }

    /// Size in bytes of the classified URI.
    pub fn uri_size(&self) -> usize {
        self.uri_size
    }

    /// Advances the parser over `buf`, the full prefix received so far.
    /// Should be called once after every successful read.
    pub fn advance(&mut self, buf: &[u8]) -> ParseStatus {
        match self.phase {
            Phase::CheckMethod => self.check_method(buf),
            Phase::FindCrlf => self.run_find_crlf(buf),
        }
    }

    fn check_method(&mut self, buf: &[u8]) -> ParseStatus {
        if buf.len() < GET.len() {
            return ParseStatus::Continue;
        }

        if &buf[..GET.len()] != GET {
            return ParseStatus::Terminate;
        }

        self.method_ok = true;
        self.crlf_scan = GET.len();
        self.uri_start = GET.len();
        self.phase = Phase::FindCrlf;

        self.run_find_crlf(buf)
    }

    fn run_find_crlf(&mut self, buf: &[u8]) -> ParseStatus {
        let mut status = ParseStatus::Continue;
        while status == ParseStatus::Continue
            && buf.len() >= CRLF.len()
            && self.crlf_scan <= buf.len() - CRLF.len()
        {
            status = self.find_crlf(buf);
        }
        status
    }

    fn find_crlf(&mut self, buf: &[u8]) -> ParseStatus {
        let window = &buf[self.crlf_scan..];
        match find_subslice(window, CRLF) {
            None => {
                // A CRLF split across reads is still found: reconsider the
                // last byte on the next call instead of re-scanning from
                // scratch.
                self.crlf_scan = buf.len() - CRLF.len() + 1;
                ParseStatus::Continue
            }
            Some(offset) => {
                let pos = self.crlf_scan + offset;
                self.crlf_scan = pos + CRLF.len();

                if !self.method_ok {
                    return ParseStatus::Terminate;
                }

                match self.prev_crlf {
                    Some(prev) if pos - prev == CRLF.len() => ParseStatus::Proceed,
                    Some(_) => {
                        self.prev_crlf = Some(pos);
                        ParseStatus::Continue
                    }
                    None => {
                        self.requestline_size = pos;
                        if !self.match_uri(buf) {
                            return ParseStatus::Terminate;
                        }
                        self.prev_crlf = Some(pos);
                        ParseStatus::Continue
                    }
                }
            }
        }
    }

    fn match_uri(&mut self, buf: &[u8]) -> bool {
        while self.uri_start < self.requestline_size && buf[self.uri_start] == b' ' {
            self.uri_start += 1;
        }

        let rest = &buf[self.uri_start..self.requestline_size];
        if rest.is_empty() {
            return false;
        }

        self.uri_size = rest
            .iter()
            .position(|&b| b == b' ')
            .unwrap_or(rest.len());
        let uri = &rest[..self.uri_size];

        if uri == URI_FAST {
            self.service = Service::Fast;
            true
        } else if uri == URI_SLOW {
            self.service = Service::Slow;
            true
        } else {
            false
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_whole(bytes: &[u8]) -> (ParseStatus, Service, usize, usize) {
        let mut parser = RequestParser::new();
        let status = parser.advance(bytes);
        (
            status,
            parser.service,
            parser.requestline_size(),
            parser.uri_size(),
        )
    }

    #[test]
    fn classifies_fast_request() {
        let (status, service, ..) =
            parse_whole(b"GET /test/fast HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(ParseStatus::Proceed, status);
        assert_eq!(Service::Fast, service);
    }

    #[test]
    fn classifies_slow_request() {
        let (status, service, ..) = parse_whole(b"GET /test/slow HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Proceed, status);
        assert_eq!(Service::Slow, service);
    }

    #[test]
    fn rejects_non_get_method() {
        let (status, ..) = parse_whole(b"POST /test/fast HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Terminate, status);
    }

    #[test]
    fn rejects_unknown_uri() {
        let (status, ..) = parse_whole(b"GET /unknown HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Terminate, status);
    }

    #[test]
    fn requests_more_bytes_for_partial_method() {
        let mut parser = RequestParser::new();
        assert_eq!(ParseStatus::Continue, parser.advance(b"GE"));
    }

    #[test]
    fn requests_more_bytes_until_final_blank_line() {
        let mut parser = RequestParser::new();
        assert_eq!(
            ParseStatus::Continue,
            parser.advance(b"GET /test/fast HTTP/1.1\r\nHost: x\r\n")
        );
    }

    #[test]
    fn is_prefix_monotonic_across_arbitrary_chunking() {
        let whole = b"GET /test/slow HTTP/1.1\r\nHost: example\r\nX-A: 1\r\n\r\n".to_vec();

        for chunk_size in 1..=whole.len() {
            let mut parser = RequestParser::new();
            let mut received = Vec::new();
            let mut final_status = ParseStatus::Continue;

            for chunk in whole.chunks(chunk_size) {
                received.extend_from_slice(chunk);
                final_status = parser.advance(&received);
                if final_status != ParseStatus::Continue {
                    break;
                }
            }

            assert_eq!(ParseStatus::Proceed, final_status, "chunk_size={chunk_size}");
            assert_eq!(Service::Slow, parser.service, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn tolerates_terminal_crlf_split_across_reads() {
        let whole = b"GET /test/fast HTTP/1.1\r\n\r\n";
        let mut parser = RequestParser::new();

        // Feed everything except the very last byte.
        let split = whole.len() - 1;
        assert_eq!(ParseStatus::Continue, parser.advance(&whole[..split]));
        assert_eq!(ParseStatus::Proceed, parser.advance(whole));
    }

    #[test]
    fn rejects_empty_uri() {
        let (status, ..) = parse_whole(b"GET  \r\n\r\n");
        assert_eq!(ParseStatus::Terminate, status);
    }
}
