//! Request id lookup in raw HTTP heads of any size

use crate::topic::REQUEST_ID_HEADER;

/// Header slots tried before sizing the table from the message itself
const INLINE_HEADERS: usize = 64;

/// Find the request id header in a request head
pub(crate) fn request_head_id(buf: &[u8]) -> Option<&str> {
    with_header_table(buf, |headers| {
        let mut request = httparse::Request::new(headers);
        if request.parse(buf)?.is_partial() {
            return Ok(None);
        }
        Ok(find_request_id(request.headers))
    })
}

/// Find the request id header in a response head
pub(crate) fn response_head_id(buf: &[u8]) -> Option<&str> {
    with_header_table(buf, |headers| {
        let mut response = httparse::Response::new(headers);
        if response.parse(buf)?.is_partial() {
            return Ok(None);
        }
        Ok(find_request_id(response.headers))
    })
}

/// Run `parse` with a small table, retrying with one slot per line when
/// the head carries more headers than fit
fn with_header_table<'b, F>(buf: &'b [u8], parse: F) -> Option<&'b str>
where
    F: Fn(&mut [httparse::Header<'b>]) -> Result<Option<&'b str>, httparse::Error>,
{
    let mut inline = [httparse::EMPTY_HEADER; INLINE_HEADERS];
    match parse(&mut inline) {
        Err(httparse::Error::TooManyHeaders) => {
            let lines = buf.iter().filter(|&&b| b == b'\n').count();
            let mut table = vec![httparse::EMPTY_HEADER; lines + 1];
            parse(&mut table).ok().flatten()
        }
        result => result.ok().flatten(),
    }
}

fn find_request_id<'b>(headers: &[httparse::Header<'b>]) -> Option<&'b str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(REQUEST_ID_HEADER))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_head(start_line: &str, fillers: usize, id: &str) -> Vec<u8> {
        let mut head = format!("{}\r\n", start_line);
        for i in 0..fillers {
            head.push_str(&format!("X-Filler-{}: {}\r\n", i, i));
        }
        head.push_str(&format!("{}: {}\r\n\r\n", REQUEST_ID_HEADER, id));
        head.into_bytes()
    }

    #[test]
    fn test_response_with_many_headers() {
        let head = padded_head("HTTP/1.1 200 OK", 70, "theirs");
        assert_eq!(response_head_id(&head), Some("theirs"));
    }

    #[test]
    fn test_request_with_many_headers() {
        let head = padded_head("GET / HTTP/1.1", 200, "abc");
        assert_eq!(request_head_id(&head), Some("abc"));
    }

    #[test]
    fn test_exactly_inline_capacity() {
        let head = padded_head("HTTP/1.1 204 No Content", INLINE_HEADERS - 1, "edge");
        assert_eq!(response_head_id(&head), Some("edge"));
    }

    #[test]
    fn test_partial_head() {
        assert_eq!(response_head_id(b"HTTP/1.1 200 OK\r\nX-Burrow-Request-Id: a"), None);
        assert_eq!(request_head_id(b"GET / HTTP/1.1\r\n"), None);
    }
}
