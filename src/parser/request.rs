//! HTTP request head parsing and representation.

use std::collections::HashMap;
use std::str::FromStr;

use crate::parser::body::BodyFraming;
use crate::parser::error::Error;
use crate::parser::method::Method;
use crate::parser::version::HttpVersion;

/// Upper bound for a request head; a buffer holding more without a blank
/// line is rejected.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// The request line and headers of an HTTP/1.x request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target: path plus query string
    pub path: String,
    /// The HTTP version
    pub version: HttpVersion,
    /// The HTTP headers, keyed by lowercase name
    pub headers: HashMap<String, String>,
    /// Query parameters parsed from the path
    pub query_params: HashMap<String, String>,
}

impl RequestHead {
    /// Create a new request head.
    ///
    /// Header names are lowercased; the query string of `path` is split into
    /// `query_params`.
    pub fn new(method: Method, path: String, version: HttpVersion, headers: HashMap<String, String>) -> Self {
        let query_params: HashMap<String, String> = path
            .split_once('?')
            .map(|(_, query)| query
                .split('&')
                .filter(|s| !s.is_empty())
                .map(|pair| {
                    if let Some((k, v)) = pair.split_once('=') {
                        (k.to_string(), v.to_string())
                    } else {
                        (pair.to_string(), String::new())
                    }
                })
                .collect())
            .unwrap_or_default();

        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();

        Self {
            method,
            path,
            version,
            headers,
            query_params,
        }
    }

    /// Get a header value. Lookup is case-insensitive.
    pub fn get_header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// Check if a header exists.
    pub fn has_header(&self, name: &str) -> bool {
        self.get_header(name).is_some()
    }

    /// Get a query parameter value.
    pub fn get_query_param(&self, name: &str) -> Option<&String> {
        self.query_params.get(name)
    }

    /// How the body following this head is delimited.
    pub fn body_framing(&self) -> Result<BodyFraming, Error> {
        if let Some(encoding) = self.get_header("transfer-encoding") {
            if encoding
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            {
                return Ok(BodyFraming::Chunked);
            }
        }

        match self.get_header("content-length") {
            Some(value) => {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::InvalidContentLength(value.clone()))?;
                if length == 0 {
                    Ok(BodyFraming::None)
                } else {
                    Ok(BodyFraming::Length(length))
                }
            }
            None => Ok(BodyFraming::None),
        }
    }

    /// Whether the peer wants the connection kept open after the response.
    pub fn keep_alive(&self) -> bool {
        let connection = self.get_header("connection").map(|v| v.to_ascii_lowercase());
        match connection.as_deref() {
            Some(value) if value.split(',').any(|t| t.trim() == "close") => false,
            Some(value) if value.split(',').any(|t| t.trim() == "keep-alive") => true,
            _ => self.version.keeps_alive_by_default(),
        }
    }
}

/// Locate the end of the head: the byte offset just past the first empty line.
fn find_head_end(input: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (index, byte) in input.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &input[line_start..index];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() && line_start > 0 {
            return Some(index + 1);
        }
        line_start = index + 1;
    }
    None
}

fn parse_head_text(input: &[u8]) -> Result<RequestHead, Error> {
    let input_str = match std::str::from_utf8(input) {
        Ok(s) => s,
        Err(_) => return Err(Error::MalformedRequestLine("Invalid UTF-8".to_string())),
    };

    let mut lines = input_str.lines();

    let request_line = match lines.next() {
        Some(line) => line,
        None => return Err(Error::EmptyRequest),
    };

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(Error::MalformedRequestLine(request_line.to_string()));
    }

    let method = Method::from_str(parts[0])?;

    let path = parts[1].to_string();
    if path.is_empty() {
        return Err(Error::InvalidPath);
    }

    let version = HttpVersion::from_str(parts[2])?;

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        // Empty line indicates the end of headers
        if line.is_empty() {
            break;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::InvalidHeaderFormat);
        };

        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        // Repeated headers are folded into one comma separated value
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    if version == HttpVersion::Http11 && !headers.contains_key("host") {
        return Err(Error::MissingHeader("Host".to_string()));
    }

    Ok(RequestHead::new(method, path, version, headers))
}

/// Parse a request head from the front of a connection buffer.
///
/// Returns `Ok(None)` while the blank line ending the head has not arrived,
/// otherwise the head and the number of bytes it occupied.
pub fn parse_request_head(input: &[u8]) -> Result<Option<(RequestHead, usize)>, Error> {
    match find_head_end(input) {
        Some(end) => {
            let head = parse_head_text(&input[..end])?;
            Ok(Some((head, end)))
        }
        None if input.len() > MAX_HEAD_SIZE => Err(Error::HeadTooLarge(MAX_HEAD_SIZE)),
        None => Ok(None),
    }
}

/// Parse a complete request head held in a byte slice.
///
/// Anything after the blank line is ignored; a slice without one is parsed
/// as if it ended there.
pub fn parse_request(input: &[u8]) -> Result<RequestHead, Error> {
    if input.is_empty() {
        return Err(Error::EmptyRequest);
    }
    let end = find_head_end(input).unwrap_or(input.len());
    parse_head_text(&input[..end])
}
