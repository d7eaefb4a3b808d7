//! Tests for the HTTP parser.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::parser::{
        decode_chunked, parse_request, parse_request_head, BodyFraming, Error, HttpVersion, Method, RequestHead,
        MAX_HEAD_SIZE,
    };

    #[test]
    fn test_parse_simple_get_request() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert_eq!(result.method, Method::GET);
        assert_eq!(result.path, "/index.html");
        assert_eq!(result.version, HttpVersion::Http11);
        assert_eq!(result.headers.get("host").unwrap(), "example.com");
    }

    #[test]
    fn test_header_names_are_lowercased() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\nAccept: */*\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert_eq!(result.headers.get("host").unwrap(), "example.com");
        assert_eq!(result.headers.get("user-agent").unwrap(), "test");
        assert_eq!(result.headers.get("accept").unwrap(), "*/*");
        assert!(result.headers.get("User-Agent").is_none());
    }

    #[test]
    fn test_case_insensitive_header_lookup() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert!(result.has_header("host"));
        assert!(result.has_header("HOST"));
        assert!(result.has_header("Host"));
    }

    #[test]
    fn test_missing_host_header() {
        let request = b"GET /index.html HTTP/1.1\r\n\r\n";
        let result = parse_request(request);
        assert!(matches!(result, Err(Error::MissingHeader(ref h)) if h == "Host"));
    }

    #[test]
    fn test_invalid_method() {
        let request = b"INVALID /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let result = parse_request(request);
        assert!(matches!(result, Err(Error::InvalidMethod(ref m)) if m == "INVALID"));
    }

    #[test]
    fn test_invalid_http_version() {
        let request = b"GET /index.html HTTP/9.9\r\nHost: example.com\r\n\r\n";
        let result = parse_request(request);
        assert!(matches!(result, Err(Error::InvalidVersion(ref v)) if v == "HTTP/9.9"));
    }

    #[test]
    fn test_invalid_header_format() {
        let request = b"GET /index.html HTTP/1.1\r\nInvalidHeader\r\n\r\n";
        let result = parse_request(request);
        assert!(matches!(result, Err(Error::InvalidHeaderFormat)));
    }

    #[test]
    fn test_empty_request() {
        let result = parse_request(b"");
        assert!(matches!(result, Err(Error::EmptyRequest)));
    }

    #[test]
    fn test_incomplete_request_line() {
        let result = parse_request(b"GET\r\n");
        assert!(matches!(result, Err(Error::MalformedRequestLine(_))));
    }

    #[test]
    fn test_all_methods() {
        let methods = vec![
            ("GET", Method::GET),
            ("POST", Method::POST),
            ("PUT", Method::PUT),
            ("DELETE", Method::DELETE),
            ("HEAD", Method::HEAD),
            ("OPTIONS", Method::OPTIONS),
            ("PATCH", Method::PATCH),
            ("TRACE", Method::TRACE),
        ];

        for (token, expected_method) in methods {
            let request = format!("{token} /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n");
            let result = parse_request(request.as_bytes()).unwrap();
            assert_eq!(result.method, expected_method);
            assert_eq!(result.method.to_string(), token);
        }
    }

    #[test]
    fn test_headers_with_multiple_colons() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nX-Test: value:with:colons\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert_eq!(result.headers.get("x-test").unwrap(), "value:with:colons");
    }

    #[test]
    fn test_http10_without_host() {
        // HTTP/1.0 doesn't require a Host header
        let request = b"GET /index.html HTTP/1.0\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert_eq!(result.version, HttpVersion::Http10);
        assert!(result.headers.is_empty());
        assert!(!result.keep_alive());
    }

    #[test]
    fn test_mixed_line_endings() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\nUser-Agent: test\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert_eq!(result.headers.get("host").unwrap(), "example.com");
        assert_eq!(result.headers.get("user-agent").unwrap(), "test");
    }

    #[test]
    fn test_empty_path() {
        let request = b"GET  HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let result = parse_request(request);
        assert!(matches!(result, Err(Error::MalformedRequestLine(_))));
    }

    #[test]
    fn test_path_with_query_parameters() {
        let request = b"GET /search?q=test&flag&empty= HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert_eq!(result.path, "/search?q=test&flag&empty=");
        assert_eq!(result.get_query_param("q").unwrap(), "test");
        assert_eq!(result.get_query_param("flag").unwrap(), "");
        assert_eq!(result.get_query_param("empty").unwrap(), "");
    }

    #[test]
    fn test_malformed_utf8_in_request() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nX-Test: \xFF\xFF\xFF\r\n\r\n";
        let result = parse_request(request);
        assert!(matches!(result, Err(Error::MalformedRequestLine(ref s)) if s == "Invalid UTF-8"));
    }

    #[test]
    fn test_duplicate_headers_are_joined() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nX-Test: value1\r\nx-test: value2\r\n\r\n";
        let result = parse_request(request).unwrap();
        assert_eq!(result.headers.get("x-test").unwrap(), "value1, value2");
    }

    #[test]
    fn test_head_is_incomplete_until_blank_line() {
        let partial = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n";
        assert!(parse_request_head(partial).unwrap().is_none());

        let complete = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\nleftover";
        let (head, consumed) = parse_request_head(complete).unwrap().unwrap();
        assert_eq!(head.path, "/index.html");
        assert_eq!(&complete[consumed..], b"leftover");
    }

    #[test]
    fn test_head_too_large() {
        let mut request = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 1));
        let result = parse_request_head(&request);
        assert!(matches!(result, Err(Error::HeadTooLarge(_))));
    }

    #[test]
    fn test_body_framing() {
        let head = parse_request(b"POST /api HTTP/1.1\r\nHost: a\r\nContent-Length: 12\r\n\r\n").unwrap();
        assert_eq!(head.body_framing().unwrap(), BodyFraming::Length(12));

        let head = parse_request(b"POST /api HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip, chunked\r\n\r\n").unwrap();
        assert_eq!(head.body_framing().unwrap(), BodyFraming::Chunked);

        let head = parse_request(b"GET /api HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(head.body_framing().unwrap(), BodyFraming::None);

        let head = parse_request(b"POST /api HTTP/1.1\r\nHost: a\r\nContent-Length: twelve\r\n\r\n").unwrap();
        assert!(matches!(head.body_framing(), Err(Error::InvalidContentLength(_))));
    }

    #[test]
    fn test_keep_alive_negotiation() {
        let head = parse_request(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert!(head.keep_alive());

        let head = parse_request(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!head.keep_alive());

        let head = parse_request(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(head.keep_alive());
    }

    #[test]
    fn test_decode_chunked_body() {
        let encoded = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\nnext";
        let (body, consumed) = decode_chunked(encoded, 1024).unwrap().unwrap();
        assert_eq!(body, b"Wikipedia");
        assert_eq!(&encoded[consumed..], b"next");
    }

    #[test]
    fn test_decode_chunked_waits_for_more_data() {
        assert!(decode_chunked(b"4\r\nWi", 1024).unwrap().is_none());
        assert!(decode_chunked(b"4\r\nWiki\r\n0\r\n", 1024).unwrap().is_none());
    }

    #[test]
    fn test_decode_chunked_rejects_garbage() {
        assert!(matches!(decode_chunked(b"zz\r\n", 1024), Err(Error::InvalidChunk)));
        assert!(matches!(decode_chunked(b"2\r\nabXY", 1024), Err(Error::InvalidChunk)));
    }

    #[test]
    fn test_decode_chunked_huge_size_does_not_overflow() {
        let encoded = b"ffffffffffffffff\r\nabc";
        assert!(matches!(decode_chunked(encoded, usize::MAX), Err(Error::InvalidChunk)));
        assert!(matches!(decode_chunked(encoded, 1024), Err(Error::BodyTooLarge(1024))));
        assert!(matches!(decode_chunked(b"fffffffffffffffffff\r\n", usize::MAX), Err(Error::InvalidChunk)));
    }

    #[test]
    fn test_decode_chunked_limits_total_size() {
        // Each chunk fits, the sum does not
        let encoded = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert!(matches!(decode_chunked(encoded, 8), Err(Error::BodyTooLarge(8))));
        assert!(decode_chunked(encoded, 9).unwrap().is_some());
    }

    #[test]
    fn test_request_head_new_lowercases_names() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let head = RequestHead::new(Method::POST, "/api".to_string(), HttpVersion::Http11, headers);
        assert_eq!(head.get_header("content-type").unwrap(), "application/json");
        assert_eq!(head.get_header("CONTENT-TYPE").unwrap(), "application/json");
    }
}
