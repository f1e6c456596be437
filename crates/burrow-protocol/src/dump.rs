use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRAILER, TRANSFER_ENCODING};
use http::{Request, Version};
use http_body::Body;
use http_body_util::BodyExt;
use thiserror::Error;

use crate::topic::{RequestId, REQUEST_ID_HEADER};

/// Errors that can occur while dumping a request for the bus
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Failed to read request body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Serialize a request into a self-contained HTTP/1.x dump.
///
/// Layout:
/// ```text
/// <METHOD> <target> HTTP/<major>.<minor>\r\n
/// Host: <host>\r\n
/// X-Burrow-Request-Id: <id>\r\n
/// <Canonical-Name>: <value>\r\n    (remaining headers)
/// \r\n
/// <body>
/// ```
///
/// The body is buffered in full. Framing headers are rewritten so that the
/// dump is delimited by `Content-Length` alone.
pub async fn encode<B>(request: Request<B>, request_id: &RequestId) -> Result<Bytes, EncodeError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = request.into_parts();

    let body = body
        .collect()
        .await
        .map_err(|e| EncodeError::Body(e.into()))?
        .to_bytes();

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = BytesMut::with_capacity(256 + body.len());
    out.put_slice(parts.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(target.as_bytes());
    out.put_u8(b' ');
    out.put_slice(version_str(parts.version).as_bytes());
    out.put_slice(b"\r\n");

    let host = parts
        .headers
        .get(HOST)
        .map(|v| v.as_bytes())
        .or_else(|| parts.uri.authority().map(|a| a.as_str().as_bytes()));
    if let Some(host) = host {
        put_header(&mut out, "Host", host);
    }

    put_header(&mut out, REQUEST_ID_HEADER, request_id.as_str().as_bytes());

    let mut framed = false;
    for (name, value) in parts.headers.iter() {
        if name == HOST || name == TRAILER || name.as_str().eq_ignore_ascii_case(REQUEST_ID_HEADER)
        {
            continue;
        }
        if name == TRANSFER_ENCODING || name == CONTENT_LENGTH {
            framed = true;
            continue;
        }
        put_header(&mut out, &canonical_header_name(name.as_str()), value.as_bytes());
    }

    if framed || !body.is_empty() {
        put_header(&mut out, "Content-Length", body.len().to_string().as_bytes());
    }

    out.put_slice(b"\r\n");
    out.put_slice(&body);

    Ok(out.freeze())
}

fn put_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Canonical MIME form of a header name: `x-forwarded-for` -> `X-Forwarded-For`
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Request id carried by a request dump, as seen by a tunnel client
pub fn dump_request_id(dump: &[u8]) -> Option<&str> {
    crate::head::request_head_id(dump)
}
