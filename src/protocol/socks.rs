//! SOCKS5 CONNECT negotiation (RFC 1928, no-auth only).
//!
//! # Data Flow
//! ```text
//! proxy  → server : 05 01 00                     (greeting, one method: no auth)
//! server → proxy  : 05 00                        (method selected)
//! proxy  → server : 05 01 00 ATYP ADDR PORT      (CONNECT)
//! server → proxy  : 05 REP 00 ATYP BND.ADDR BND.PORT
//! ```
//!
//! # Design Decisions
//! - Sans-IO: the negotiator only produces and consumes byte slices, the
//!   caller owns the socket
//! - Only the bytes of the reply are consumed; anything after it belongs to
//!   the tunnel
//! - The reply code is checked as soon as it arrives

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCEEDED: u8 = 0x00;

/// Handshake errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SocksError {
    #[error("server refused CONNECT (code {code}): {reason}")]
    Rejected { code: u8, reason: &'static str },

    #[error("server accepted none of the offered methods")]
    NoAcceptableMethod,

    #[error("server selected unsupported method {0:#04x}")]
    UnexpectedMethod(u8),

    #[error("unexpected protocol version {0:#04x}")]
    InvalidVersion(u8),

    #[error("non-zero reserved byte {0:#04x}")]
    InvalidReserved(u8),

    #[error("unknown address type {0:#04x}")]
    InvalidAddressType(u8),

    #[error("destination host of {0} bytes does not fit a SOCKS5 frame")]
    DomainTooLong(usize),

    #[error("destination host is empty")]
    EmptyHost,

    #[error("bytes received in phase {0:?}")]
    UnexpectedData(SocksPhase),

    #[error("connection closed during handshake")]
    Closed,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksPhase {
    /// Greeting not written yet.
    Greeting,
    /// Waiting for the method selection reply.
    AwaitMethod,
    /// CONNECT frame ready to be written.
    Connect,
    /// Waiting for the CONNECT reply.
    AwaitReply,
    Established,
    Failed,
}

/// Result of feeding reply bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksProgress {
    pub consumed: usize,
    pub established: bool,
}

/// Client side of a SOCKS5 CONNECT handshake.
#[derive(Debug)]
pub struct SocksNegotiator {
    phase: SocksPhase,
    connect_frame: Vec<u8>,
    inbound: Vec<u8>,
    bound: Option<String>,
}

impl SocksNegotiator {
    /// Prepare a handshake towards `host:port`.
    ///
    /// A literal IPv4/IPv6 host is sent as an address, anything else as a
    /// domain name for the server to resolve.
    pub fn new(host: &str, port: u16) -> Result<Self, SocksError> {
        Ok(Self {
            phase: SocksPhase::Greeting,
            connect_frame: connect_frame(host, port)?,
            inbound: Vec::with_capacity(22),
            bound: None,
        })
    }

    pub fn phase(&self) -> SocksPhase {
        self.phase
    }

    pub fn is_established(&self) -> bool {
        self.phase == SocksPhase::Established
    }

    /// Address the server reported as bound, once established.
    pub fn bound_address(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    /// Bytes the caller must write next, if any.
    pub fn take_outbound(&mut self) -> Option<Vec<u8>> {
        match self.phase {
            SocksPhase::Greeting => {
                self.phase = SocksPhase::AwaitMethod;
                Some(vec![SOCKS_VERSION, 1, METHOD_NO_AUTH])
            }
            SocksPhase::Connect => {
                self.phase = SocksPhase::AwaitReply;
                Some(std::mem::take(&mut self.connect_frame))
            }
            _ => None,
        }
    }

    /// Feed bytes read from the SOCKS server.
    pub fn feed(&mut self, input: &[u8]) -> Result<SocksProgress, SocksError> {
        let mut consumed = 0;
        while consumed < input.len() {
            match self.phase {
                SocksPhase::AwaitMethod | SocksPhase::AwaitReply => {}
                SocksPhase::Established | SocksPhase::Connect => break,
                phase => return Err(self.fail(SocksError::UnexpectedData(phase))),
            }

            let wanted = match self.expected_len() {
                Ok(n) => n,
                Err(e) => return Err(self.fail(e)),
            };
            let take = (wanted - self.inbound.len()).min(input.len() - consumed);
            self.inbound.extend_from_slice(&input[consumed..consumed + take]);
            consumed += take;

            if let Err(e) = self.check_prefix() {
                return Err(self.fail(e));
            }
            let needed = match self.expected_len() {
                Ok(n) => n,
                Err(e) => return Err(self.fail(e)),
            };
            if self.inbound.len() == needed {
                self.advance();
            }
        }

        Ok(SocksProgress { consumed, established: self.is_established() })
    }

    /// Total reply length needed in the current phase, as far as it is known.
    fn expected_len(&self) -> Result<usize, SocksError> {
        match self.phase {
            SocksPhase::AwaitMethod => Ok(2),
            SocksPhase::AwaitReply => {
                if self.inbound.len() < 4 {
                    return Ok(4);
                }
                match self.inbound[3] {
                    ATYP_IPV4 => Ok(4 + 4 + 2),
                    ATYP_IPV6 => Ok(4 + 16 + 2),
                    ATYP_DOMAIN => match self.inbound.get(4) {
                        Some(&len) => Ok(4 + 1 + len as usize + 2),
                        None => Ok(5),
                    },
                    other => Err(SocksError::InvalidAddressType(other)),
                }
            }
            _ => Ok(0),
        }
    }

    /// Validate whatever fixed-position bytes have arrived.
    fn check_prefix(&self) -> Result<(), SocksError> {
        let buf = &self.inbound;
        if let Some(&version) = buf.first() {
            if version != SOCKS_VERSION {
                return Err(SocksError::InvalidVersion(version));
            }
        }
        match self.phase {
            SocksPhase::AwaitMethod => match buf.get(1) {
                Some(&METHOD_NO_AUTH) | None => Ok(()),
                Some(&METHOD_NONE_ACCEPTABLE) => Err(SocksError::NoAcceptableMethod),
                Some(&other) => Err(SocksError::UnexpectedMethod(other)),
            },
            SocksPhase::AwaitReply => {
                if let Some(&code) = buf.get(1) {
                    if code != REP_SUCCEEDED {
                        return Err(SocksError::Rejected { code, reason: reply_reason(code) });
                    }
                }
                match buf.get(2) {
                    Some(&0) | None => Ok(()),
                    Some(&other) => Err(SocksError::InvalidReserved(other)),
                }
            }
            _ => Ok(()),
        }
    }

    fn advance(&mut self) {
        match self.phase {
            SocksPhase::AwaitMethod => {
                self.inbound.clear();
                self.phase = SocksPhase::Connect;
            }
            SocksPhase::AwaitReply => {
                self.bound = describe_bound(&self.inbound);
                self.inbound.clear();
                self.phase = SocksPhase::Established;
            }
            _ => {}
        }
    }

    fn fail(&mut self, err: SocksError) -> SocksError {
        self.phase = SocksPhase::Failed;
        err
    }
}

/// Build the CONNECT request for `host:port`.
pub fn connect_frame(host: &str, port: u16) -> Result<Vec<u8>, SocksError> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if literal.is_empty() {
        return Err(SocksError::EmptyHost);
    }

    let mut frame = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match literal.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            frame.push(ATYP_IPV4);
            frame.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            frame.push(ATYP_IPV6);
            frame.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| SocksError::DomainTooLong(host.len()))?;
            frame.push(ATYP_DOMAIN);
            frame.push(len);
            frame.extend_from_slice(host.as_bytes());
        }
    }
    frame.extend_from_slice(&port.to_be_bytes());
    Ok(frame)
}

fn describe_bound(reply: &[u8]) -> Option<String> {
    let port_at = reply.len().checked_sub(2)?;
    let port = u16::from_be_bytes([reply[port_at], reply[port_at + 1]]);
    let host = match reply.get(3)? {
        &ATYP_IPV4 => {
            let o: [u8; 4] = reply.get(4..8)?.try_into().ok()?;
            Ipv4Addr::from(o).to_string()
        }
        &ATYP_IPV6 => {
            let o: [u8; 16] = reply.get(4..20)?.try_into().ok()?;
            format!("[{}]", Ipv6Addr::from(o))
        }
        _ => String::from_utf8_lossy(reply.get(5..port_at)?).into_owned(),
    };
    Some(format!("{}:{}", host, port))
}

/// Reply codes as listed in RFC 1928 section 6.
pub fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_frame_ipv4() {
        let frame = connect_frame("10.0.0.5", 1080).unwrap();
        assert_eq!(frame, vec![5, 1, 0, 1, 10, 0, 0, 5, 0x04, 0x38]);
    }

    #[test]
    fn test_connect_frame_domain_and_ipv6() {
        let frame = connect_frame("example.org", 80).unwrap();
        assert_eq!(&frame[..5], &[5, 1, 0, 3, 11]);
        assert_eq!(&frame[5..16], b"example.org");
        assert_eq!(&frame[16..], &[0, 80]);

        let frame = connect_frame("[::1]", 443).unwrap();
        assert_eq!(frame[3], 4);
        assert_eq!(frame.len(), 4 + 16 + 2);

        let long = "a".repeat(300);
        assert_eq!(connect_frame(&long, 1).unwrap_err(), SocksError::DomainTooLong(300));
        assert_eq!(connect_frame("", 1).unwrap_err(), SocksError::EmptyHost);
    }

    #[test]
    fn test_full_handshake_in_pieces() {
        let mut socks = SocksNegotiator::new("10.0.0.5", 1080).unwrap();
        assert_eq!(socks.take_outbound().unwrap(), vec![5, 1, 0]);
        assert!(socks.take_outbound().is_none());

        assert_eq!(socks.feed(&[5]).unwrap().consumed, 1);
        assert_eq!(socks.feed(&[0]).unwrap().consumed, 1);
        assert_eq!(socks.phase(), SocksPhase::Connect);
        assert_eq!(socks.take_outbound().unwrap()[3], ATYP_IPV4);

        let progress = socks.feed(&[5, 0, 0, 1, 127, 0]).unwrap();
        assert!(!progress.established);
        let progress = socks.feed(&[0, 1, 0x1f, 0x90, b'H', b'T']).unwrap();
        assert!(progress.established);
        assert_eq!(progress.consumed, 4);
        assert_eq!(socks.bound_address(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn test_rejection_code() {
        let mut socks = SocksNegotiator::new("example.org", 80).unwrap();
        socks.take_outbound();
        socks.feed(&[5, 0]).unwrap();
        socks.take_outbound();
        let err = socks.feed(&[5, 5]).unwrap_err();
        assert_eq!(err, SocksError::Rejected { code: 5, reason: "connection refused" });
        assert_eq!(socks.phase(), SocksPhase::Failed);
    }

    #[test]
    fn test_no_acceptable_method() {
        let mut socks = SocksNegotiator::new("example.org", 80).unwrap();
        socks.take_outbound();
        assert_eq!(socks.feed(&[5, 0xff]).unwrap_err(), SocksError::NoAcceptableMethod);
    }

    #[test]
    fn test_malformed_reply() {
        let mut socks = SocksNegotiator::new("example.org", 80).unwrap();
        socks.take_outbound();
        assert_eq!(socks.feed(&[4, 0]).unwrap_err(), SocksError::InvalidVersion(4));

        let mut socks = SocksNegotiator::new("example.org", 80).unwrap();
        socks.take_outbound();
        socks.feed(&[5, 0]).unwrap();
        socks.take_outbound();
        assert_eq!(
            socks.feed(&[5, 0, 0, 9]).unwrap_err(),
            SocksError::InvalidAddressType(9)
        );
    }

    #[test]
    fn test_domain_bound_reply() {
        let mut socks = SocksNegotiator::new("example.org", 80).unwrap();
        socks.take_outbound();
        socks.feed(&[5, 0]).unwrap();
        socks.take_outbound();
        let mut reply = vec![5, 0, 0, 3, 4];
        reply.extend_from_slice(b"host");
        reply.extend_from_slice(&[0, 80]);
        let progress = socks.feed(&reply).unwrap();
        assert!(progress.established);
        assert_eq!(progress.consumed, reply.len());
        assert_eq!(socks.bound_address(), Some("host:80"));
    }
}
