//! Upstream status line parser.
//!
//! # States
//! ```text
//! ExpectVersion --SP--> ExpectCode --3 digits, SP/CR/LF--> ExpectReason --LF--> Done
//!       any malformed byte or overlong line ------------------------------> Error
//! ```
//!
//! The parser is fed whatever bytes are available and resumes where it left
//! off; it never needs the whole line in one slice.

use std::fmt;
use thiserror::Error;

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    ExpectVersion,
    ExpectCode,
    ExpectReason,
    Done,
    Error,
}

/// HTTP version carried on the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_10: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_11: HttpVersion = HttpVersion { major: 1, minor: 1 };
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// A parsed status line. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: String,
    pub version: HttpVersion,
}

impl Status {
    /// Interim responses that are followed by the real one.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.code) && self.code != 101
    }

    /// Statuses that never carry a body regardless of headers.
    pub fn forbids_body(&self) -> bool {
        (100..200).contains(&self.code) || self.code == 204 || self.code == 304
    }
}

/// Errors raised on a malformed status line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("invalid HTTP version token {0:?}")]
    InvalidVersion(String),

    #[error("invalid status code byte {0:#04x}")]
    InvalidCode(u8),

    #[error("status code {0} out of range")]
    CodeOutOfRange(u16),

    #[error("status line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("status line parser already failed")]
    Failed,
}

/// Outcome of one `parse` call.
#[derive(Debug, PartialEq, Eq)]
pub enum StatusProgress {
    /// All input consumed, the line is not finished yet.
    Incomplete { consumed: usize },
    /// The line ended after `consumed` bytes.
    Complete { consumed: usize, status: Status },
}

const MAX_VERSION_TOKEN: usize = 16;

/// Incremental status line parser.
#[derive(Debug)]
pub struct StatusParser {
    state: StatusState,
    version: Vec<u8>,
    parsed_version: HttpVersion,
    code: u16,
    code_digits: u8,
    reason: Vec<u8>,
    seen: usize,
    max_len: usize,
}

impl StatusParser {
    pub fn new(max_len: usize) -> Self {
        Self {
            state: StatusState::ExpectVersion,
            version: Vec::with_capacity(MAX_VERSION_TOKEN),
            parsed_version: HttpVersion::HTTP_11,
            code: 0,
            code_digits: 0,
            reason: Vec::new(),
            seen: 0,
            max_len,
        }
    }

    pub fn state(&self) -> StatusState {
        self.state
    }

    /// Start over for the next status line (after an interim 1xx response).
    pub fn reset(&mut self) {
        *self = Self::new(self.max_len);
    }

    /// Feed available bytes.
    pub fn parse(&mut self, input: &[u8]) -> Result<StatusProgress, StatusError> {
        match self.state {
            StatusState::Error => return Err(StatusError::Failed),
            StatusState::Done => return Ok(StatusProgress::Incomplete { consumed: 0 }),
            _ => {}
        }

        for (i, &b) in input.iter().enumerate() {
            self.seen += 1;
            if self.seen > self.max_len {
                return Err(self.fail(StatusError::LineTooLong(self.max_len)));
            }

            match self.state {
                StatusState::ExpectVersion => match b {
                    b' ' => {
                        self.parsed_version = match parse_version(&self.version) {
                            Some(v) => v,
                            None => {
                                let token = String::from_utf8_lossy(&self.version).into_owned();
                                return Err(self.fail(StatusError::InvalidVersion(token)));
                            }
                        };
                        self.state = StatusState::ExpectCode;
                    }
                    b'\r' | b'\n' => {
                        let token = String::from_utf8_lossy(&self.version).into_owned();
                        return Err(self.fail(StatusError::InvalidVersion(token)));
                    }
                    _ => {
                        if self.version.len() >= MAX_VERSION_TOKEN {
                            let token = String::from_utf8_lossy(&self.version).into_owned();
                            return Err(self.fail(StatusError::InvalidVersion(token)));
                        }
                        self.version.push(b);
                    }
                },
                StatusState::ExpectCode => {
                    if self.code_digits < 3 {
                        match b {
                            b' ' if self.code_digits == 0 => {}
                            b'0'..=b'9' => {
                                self.code = self.code * 10 + u16::from(b - b'0');
                                self.code_digits += 1;
                            }
                            _ => return Err(self.fail(StatusError::InvalidCode(b))),
                        }
                        continue;
                    }

                    if !(100..=599).contains(&self.code) {
                        return Err(self.fail(StatusError::CodeOutOfRange(self.code)));
                    }
                    match b {
                        b' ' => self.state = StatusState::ExpectReason,
                        b'\r' => {
                            self.reason.push(b);
                            self.state = StatusState::ExpectReason;
                        }
                        b'\n' => return Ok(self.complete(i + 1)),
                        _ => return Err(self.fail(StatusError::InvalidCode(b))),
                    }
                }
                StatusState::ExpectReason => {
                    if b == b'\n' {
                        return Ok(self.complete(i + 1));
                    }
                    self.reason.push(b);
                }
                StatusState::Done | StatusState::Error => unreachable!("terminal states return early"),
            }
        }

        Ok(StatusProgress::Incomplete { consumed: input.len() })
    }

    fn complete(&mut self, consumed: usize) -> StatusProgress {
        if self.reason.last() == Some(&b'\r') {
            self.reason.pop();
        }
        self.state = StatusState::Done;
        let status = Status {
            code: self.code,
            reason: String::from_utf8_lossy(&self.reason).trim().to_string(),
            version: self.parsed_version,
        };
        StatusProgress::Complete { consumed, status }
    }

    fn fail(&mut self, err: StatusError) -> StatusError {
        self.state = StatusState::Error;
        err
    }
}

fn parse_version(token: &[u8]) -> Option<HttpVersion> {
    let rest = token.strip_prefix(b"HTTP/")?;
    let dot = rest.iter().position(|&b| b == b'.')?;
    let (major, minor) = (&rest[..dot], &rest[dot + 1..]);
    Some(HttpVersion {
        major: parse_small(major)?,
        minor: parse_small(minor)?,
    })
}

fn parse_small(digits: &[u8]) -> Option<u8> {
    if digits.is_empty() || digits.len() > 3 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(line: &[u8]) -> Result<StatusProgress, StatusError> {
        StatusParser::new(1024).parse(line)
    }

    #[test]
    fn test_parses_full_line() {
        let progress = parse_all(b"HTTP/1.1 204 No Content\r\nServer: x").unwrap();
        match progress {
            StatusProgress::Complete { consumed, status } => {
                assert_eq!(consumed, 25);
                assert_eq!(status.code, 204);
                assert_eq!(status.reason, "No Content");
                assert_eq!(status.version, HttpVersion::HTTP_11);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resumes_across_partial_reads() {
        let mut parser = StatusParser::new(1024);
        assert_eq!(
            parser.parse(b"HTTP/1.0 40").unwrap(),
            StatusProgress::Incomplete { consumed: 11 }
        );
        assert_eq!(parser.state(), StatusState::ExpectCode);
        match parser.parse(b"4 Not Found\n").unwrap() {
            StatusProgress::Complete { consumed, status } => {
                assert_eq!(consumed, 12);
                assert_eq!(status.code, 404);
                assert_eq!(status.reason, "Not Found");
                assert_eq!(status.version, HttpVersion::HTTP_10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parser.state(), StatusState::Done);
    }

    #[test]
    fn test_empty_reason() {
        match parse_all(b"HTTP/1.1 200\r\n").unwrap() {
            StatusProgress::Complete { status, .. } => {
                assert_eq!(status.code, 200);
                assert!(status.reason.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejects_non_numeric_code() {
        assert_eq!(
            parse_all(b"HTTP/1.1 2x0 OK\r\n").unwrap_err(),
            StatusError::InvalidCode(b'x')
        );
    }

    #[test]
    fn test_rejects_out_of_range_code() {
        assert_eq!(
            parse_all(b"HTTP/1.1 999 Nope\r\n").unwrap_err(),
            StatusError::CodeOutOfRange(999)
        );
    }

    #[test]
    fn test_rejects_bad_version() {
        assert!(matches!(
            parse_all(b"ICY 200 OK\r\n").unwrap_err(),
            StatusError::InvalidVersion(_)
        ));
    }

    #[test]
    fn test_bounded_line_length() {
        let mut parser = StatusParser::new(32);
        let mut line = b"HTTP/1.1 200 ".to_vec();
        line.extend(std::iter::repeat(b'a').take(64));
        assert_eq!(parser.parse(&line).unwrap_err(), StatusError::LineTooLong(32));
        assert_eq!(parser.state(), StatusState::Error);
        assert_eq!(parser.parse(b"\r\n").unwrap_err(), StatusError::Failed);
    }

    #[test]
    fn test_interim_and_bodyless() {
        let s = Status { code: 100, reason: String::new(), version: HttpVersion::HTTP_11 };
        assert!(s.is_interim());
        assert!(s.forbids_body());
        let s = Status { code: 304, reason: String::new(), version: HttpVersion::HTTP_11 };
        assert!(!s.is_interim());
        assert!(s.forbids_body());
    }
}
