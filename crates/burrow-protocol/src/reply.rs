use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

/// Prefix distinguishing a reply from a request travelling on the same topic
pub const REPLY_SIGIL: &[u8; 2] = b"X-";

/// Extract the raw HTTP response from a bus message.
///
/// Returns `None` for anything that is not a reply, including our own
/// request echoed back by the broker.
pub fn decode(message: &Bytes) -> Option<Bytes> {
    if message.starts_with(REPLY_SIGIL) {
        Some(message.slice(REPLY_SIGIL.len()..))
    } else {
        None
    }
}

/// Wrap a raw HTTP response as a reply message
pub fn encode_reply(response: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(REPLY_SIGIL.len() + response.len());
    out.put_slice(REPLY_SIGIL);
    out.put_slice(response);
    out.freeze()
}

/// Request id a tunnel client echoed into its response head, if any
pub fn reply_request_id(response: &[u8]) -> Option<&str> {
    crate::head::response_head_id(response)
}

/// Complete HTTP response sent when a client never answered.
///
/// With the default ten second wait this is byte-for-byte the document
/// tunnel deployments already expect.
pub fn no_reply_response(waited: Duration) -> Bytes {
    let body = format!(
        "HTTP/1.0 200 OK\n\
         Content-type: text/html; charset=UTF-8\n\
         Connection: close\n\
         \n\
         <!DOCTYPE html>\n\
         <html>\n\
         <body>\n\
         <p>We didn't receive a reply from the remote host, despite waiting {} seconds.</p>\n\
         </body>\n\
         </html>\n",
        waited.as_secs()
    );
    Bytes::from(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_NO_REPLY: &str = "HTTP/1.0 200 OK
Content-type: text/html; charset=UTF-8
Connection: close

<!DOCTYPE html>
<html>
<body>
<p>We didn't receive a reply from the remote host, despite waiting 10 seconds.</p>
</body>
</html>
";

    #[test]
    fn test_decode_strips_sigil() {
        let msg = Bytes::from_static(b"X-HTTP/1.1 200 OK\r\n\r\nhi");
        assert_eq!(
            decode(&msg),
            Some(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nhi"))
        );
    }

    #[test]
    fn test_decode_ignores_requests() {
        let msg = Bytes::from_static(b"GET / HTTP/1.1\r\nHost: foo\r\n\r\n");
        assert_eq!(decode(&msg), None);
        assert_eq!(decode(&Bytes::from_static(b"X")), None);
        assert_eq!(decode(&Bytes::new()), None);
    }

    #[test]
    fn test_decode_bare_sigil_is_empty_reply() {
        assert_eq!(decode(&Bytes::from_static(b"X-")), Some(Bytes::new()));
    }

    #[test]
    fn test_decode_is_binary_safe() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let msg = encode_reply(&payload);
        assert_eq!(decode(&msg).as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn test_reply_request_id() {
        let tagged = b"HTTP/1.1 200 OK\r\nx-burrow-request-id: abc123\r\nContent-Length: 2\r\n\r\nhi";
        assert_eq!(reply_request_id(tagged), Some("abc123"));

        let untagged = b"HTTP/1.1 200 OK\r\n\r\nhi";
        assert_eq!(reply_request_id(untagged), None);

        assert_eq!(reply_request_id(b"garbage"), None);
    }

    #[test]
    fn test_reply_request_id_after_many_headers() {
        let mut response = String::from("HTTP/1.1 200 OK\r\n");
        for i in 0..70 {
            response.push_str(&format!("Set-Cookie: c{}=v\r\n", i));
        }
        response.push_str("X-Burrow-Request-Id: theirs\r\nContent-Length: 0\r\n\r\n");

        assert_eq!(reply_request_id(response.as_bytes()), Some("theirs"));
    }

    #[test]
    fn test_no_reply_response_default_document() {
        let doc = no_reply_response(Duration::from_secs(10));
        assert_eq!(&doc[..], DEFAULT_NO_REPLY.as_bytes());
    }

    #[test]
    fn test_no_reply_response_follows_wait() {
        let doc = no_reply_response(Duration::from_secs(3));
        let text = std::str::from_utf8(&doc).unwrap();
        assert!(text.contains("despite waiting 3 seconds."));
        assert!(text.starts_with("HTTP/1.0 200 OK\n"));
    }
}
