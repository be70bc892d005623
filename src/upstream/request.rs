//! Upstream request rendering.
//!
//! The request always goes out as HTTP/1.1 with `Connection: close`; the
//! response is read until the upstream ends it.

use std::net::IpAddr;

use bytes::{BufMut, BytesMut};

use crate::http::request::{ClientRequest, RequestId, X_REQUEST_ID};
use crate::protocol::headers::{connection_tokens, is_hop_by_hop};
use crate::upstream::ProxyVars;

/// Per-request values added to the forwarded headers.
#[derive(Debug, Clone)]
pub struct Forwarding<'a> {
    pub request_id: &'a RequestId,
    pub client_ip: Option<IpAddr>,
    pub add_forwarded_for: bool,
}

/// Render the literal request written to the upstream.
pub fn render_request(vars: &ProxyVars, request: &ClientRequest, forwarding: &Forwarding<'_>) -> BytesMut {
    let mut out = BytesMut::with_capacity(256 + request.body.len());

    put_line(&mut out, &[request.method.as_bytes(), b" ", vars.request_uri().as_bytes(), b" HTTP/1.1"]);
    put_line(&mut out, &[b"Host: ", vars.host_header.as_bytes()]);
    put_line(&mut out, &[b"Connection: close"]);

    let tokens = connection_tokens(request.headers.iter().map(|(n, v)| (n.as_str(), v.as_slice())));
    let mut forwarded_for: Option<Vec<u8>> = None;

    for (name, value) in &request.headers {
        if is_hop_by_hop(name, &tokens)
            || name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case(X_REQUEST_ID)
        {
            continue;
        }
        if forwarding.add_forwarded_for && name.eq_ignore_ascii_case("x-forwarded-for") {
            forwarded_for = Some(value.clone());
            continue;
        }
        put_line(&mut out, &[name.as_bytes(), b": ", value.as_slice()]);
    }

    if forwarding.add_forwarded_for {
        if let Some(ip) = forwarding.client_ip {
            let ip = ip.to_string();
            match forwarded_for {
                Some(existing) => {
                    put_line(&mut out, &[b"X-Forwarded-For: ", existing.as_slice(), b", ", ip.as_bytes()])
                }
                None => put_line(&mut out, &[b"X-Forwarded-For: ", ip.as_bytes()]),
            }
        } else if let Some(existing) = forwarded_for {
            put_line(&mut out, &[b"X-Forwarded-For: ", existing.as_slice()]);
        }
    }

    put_line(&mut out, &[b"X-Request-Id: ", forwarding.request_id.as_str().as_bytes()]);

    if !request.body.is_empty() || request.header("content-length").is_some() {
        let length = request.body.len().to_string();
        put_line(&mut out, &[b"Content-Length: ", length.as_bytes()]);
    }

    out.put_slice(b"\r\n");
    out.put_slice(&request.body);
    out
}

fn put_line(out: &mut BytesMut, parts: &[&[u8]]) {
    for part in parts {
        out.put_slice(part);
    }
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status::HttpVersion;
    use crate::upstream::DestinationResolver;
    use bytes::Bytes;

    fn request(headers: &[(&str, &str)], body: &'static [u8]) -> ClientRequest {
        ClientRequest {
            method: "POST".into(),
            path: "/submit".into(),
            authority: Some("site.test".into()),
            version: HttpVersion::HTTP_11,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.as_bytes().to_vec()))
                .collect(),
            body: Bytes::from_static(body),
            surplus: Bytes::new(),
        }
    }

    #[test]
    fn test_render_strips_hop_by_hop_and_rewrites_host() {
        let vars = DestinationResolver::new("http://backend:8080")
            .resolve(&crate::upstream::RequestTarget { authority: None, path: "/submit" })
            .unwrap();
        let req = request(
            &[
                ("Host", "site.test"),
                ("Connection", "keep-alive, X-Private"),
                ("X-Private", "secret"),
                ("Keep-Alive", "timeout=5"),
                ("Content-Type", "text/plain"),
                ("Content-Length", "2"),
                ("X-Forwarded-For", "192.0.2.1"),
            ],
            b"hi",
        );
        let id = RequestId::from_header(b"req-1").unwrap();
        let rendered = render_request(
            &vars,
            &req,
            &Forwarding {
                request_id: &id,
                client_ip: Some("203.0.113.9".parse().unwrap()),
                add_forwarded_for: true,
            },
        );

        let text = String::from_utf8(rendered.to_vec()).unwrap();
        assert_eq!(
            text,
            "POST /submit HTTP/1.1\r\n\
             Host: backend:8080\r\n\
             Connection: close\r\n\
             Content-Type: text/plain\r\n\
             X-Forwarded-For: 192.0.2.1, 203.0.113.9\r\n\
             X-Request-Id: req-1\r\n\
             Content-Length: 2\r\n\
             \r\n\
             hi"
        );
    }

    #[test]
    fn test_bodyless_request_has_no_length() {
        let vars = DestinationResolver::new("http://backend")
            .resolve(&crate::upstream::RequestTarget { authority: None, path: "/" })
            .unwrap();
        let mut req = request(&[], b"");
        req.method = "GET".into();
        let id = RequestId::new();
        let rendered = render_request(
            &vars,
            &req,
            &Forwarding { request_id: &id, client_ip: None, add_forwarded_for: false },
        );
        let text = String::from_utf8(rendered.to_vec()).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: backend\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
