//! Chunked transfer-coding boundary tracking.
//!
//! The proxy relays chunked bodies verbatim; it only needs to know where the
//! message ends so the upstream connection can be reused and the client
//! connection kept alive. [`ChunkedScanner`] walks the bytes without copying
//! or decoding them; chunk-size lines go through `httparse::parse_chunk_size`.

use httparse::Status;

use crate::error::ProxyError;

/// Longest chunk-size line (size plus extensions) we are willing to buffer.
const MAX_SIZE_LINE: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SizeLine,
    Data { remaining: u64 },
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    FinalLf,
    Done,
}

/// Incremental scanner for a chunked message body.
#[derive(Debug, Clone)]
pub struct ChunkedScanner {
    state: State,
    /// Size line collected so far when it straddles reads.
    line: Vec<u8>,
}

impl Default for ChunkedScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedScanner {
    pub fn new() -> Self {
        Self {
            state: State::SizeLine,
            line: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Scan `input`, returning how many bytes belong to the body.
    ///
    /// Returns less than `input.len()` only once the terminating chunk and
    /// trailers have been seen.
    pub fn advance(&mut self, input: &[u8]) -> Result<usize, ProxyError> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                State::Done => break,
                State::Data { remaining } => {
                    let take = remaining.min((input.len() - pos) as u64);
                    pos += take as usize;
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        State::DataCr
                    } else {
                        State::Data { remaining }
                    };
                    continue;
                }
                State::SizeLine => {
                    let rest = &input[pos..];
                    let Some(nl) = memchr::memchr(b'\n', rest) else {
                        self.buffer_line(rest)?;
                        pos = input.len();
                        continue;
                    };
                    self.buffer_line(&rest[..=nl])?;
                    pos += nl + 1;
                    let size = match httparse::parse_chunk_size(&self.line) {
                        Ok(Status::Complete((_, size))) => size,
                        _ => return Err(invalid()),
                    };
                    self.line.clear();
                    self.state = if size == 0 {
                        State::TrailerStart
                    } else {
                        State::Data { remaining: size }
                    };
                    continue;
                }
                _ => {}
            }

            let byte = input[pos];
            pos += 1;
            self.state = match self.state {
                State::DataCr => match byte {
                    b'\r' => State::DataLf,
                    b'\n' => State::SizeLine,
                    _ => return Err(invalid()),
                },
                State::DataLf => match byte {
                    b'\n' => State::SizeLine,
                    _ => return Err(invalid()),
                },
                State::TrailerStart => match byte {
                    b'\r' => State::FinalLf,
                    b'\n' => State::Done,
                    _ => State::TrailerLine,
                },
                State::TrailerLine => match byte {
                    b'\n' => State::TrailerStart,
                    _ => State::TrailerLine,
                },
                State::FinalLf => match byte {
                    b'\n' => State::Done,
                    _ => return Err(invalid()),
                },
                other => other,
            };
        }
        Ok(pos)
    }

    fn buffer_line(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        if self.line.len() + bytes.len() > MAX_SIZE_LINE {
            return Err(invalid());
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }
}

fn invalid() -> ProxyError {
    ProxyError::UpstreamProtocol("invalid chunked encoding")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_end_of_body_in_one_pass() {
        let body = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\nNEXT";
        let mut scanner = ChunkedScanner::new();
        let used = scanner.advance(body).unwrap();
        assert!(scanner.is_done());
        assert_eq!(&body[used..], b"NEXT");
    }

    #[test]
    fn byte_at_a_time_with_trailers() {
        let body = b"A\r\n0123456789\r\n0\r\nX-Checksum: abc\r\n\r\n";
        let mut scanner = ChunkedScanner::new();
        for (i, byte) in body.iter().enumerate() {
            assert!(!scanner.is_done(), "done early at {i}");
            assert_eq!(scanner.advance(std::slice::from_ref(byte)).unwrap(), 1);
        }
        assert!(scanner.is_done());
    }

    #[test]
    fn rejects_garbage() {
        let mut scanner = ChunkedScanner::new();
        assert!(scanner.advance(b"zz\r\n").is_err());

        let mut scanner = ChunkedScanner::new();
        assert!(scanner.advance(b"3\r\nabcX").is_err());

        let mut scanner = ChunkedScanner::new();
        assert!(scanner.advance(b"ffffffffffffffffff\r\n").is_err());
    }

    #[test]
    fn size_line_split_across_reads() {
        let mut scanner = ChunkedScanner::new();
        assert_eq!(scanner.advance(b"1").unwrap(), 1);
        assert_eq!(scanner.advance(b"0;name=va").unwrap(), 9);
        assert_eq!(scanner.advance(b"lue\r").unwrap(), 4);
        assert_eq!(scanner.advance(b"\n0123456789abcdef\r\n0\r\n\r\nX").unwrap(), 24);
        assert!(scanner.is_done());
    }
}
