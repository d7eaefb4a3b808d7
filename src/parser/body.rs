//! Request body framing.

use crate::parser::error::Error;

/// How a request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes follow the head.
    Length(usize),
    /// The body uses chunked transfer encoding.
    Chunked,
}

fn find_crlf(input: &[u8], from: usize) -> Option<usize> {
    input
        .get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|offset| from + offset)
}

/// Decode a chunked body from the front of `input`.
///
/// Returns `Ok(None)` while the terminating zero-size chunk (and its trailer
/// section) has not fully arrived, otherwise the decoded body and the number
/// of bytes consumed. Fails with [`Error::BodyTooLarge`] as soon as the
/// declared chunk sizes add up to more than `max_body_size`.
pub fn decode_chunked(input: &[u8], max_body_size: usize) -> Result<Option<(Vec<u8>, usize)>, Error> {
    let mut body = Vec::new();
    let mut position = 0;

    loop {
        let Some(line_end) = find_crlf(input, position) else {
            return Ok(None);
        };
        let size_line = std::str::from_utf8(&input[position..line_end]).map_err(|_| Error::InvalidChunk)?;
        let size_text = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| Error::InvalidChunk)?;
        position = line_end + 2;

        if size == 0 {
            // Skip trailer fields up to the empty line
            loop {
                let Some(trailer_end) = find_crlf(input, position) else {
                    return Ok(None);
                };
                let empty = trailer_end == position;
                position = trailer_end + 2;
                if empty {
                    return Ok(Some((body, position)));
                }
            }
        }

        if size > max_body_size.saturating_sub(body.len()) {
            return Err(Error::BodyTooLarge(max_body_size));
        }
        let data_end = position.checked_add(size).ok_or(Error::InvalidChunk)?;
        let chunk_end = data_end.checked_add(2).ok_or(Error::InvalidChunk)?;
        if input.len() < chunk_end {
            return Ok(None);
        }
        body.extend_from_slice(&input[position..data_end]);
        if &input[data_end..chunk_end] != b"\r\n" {
            return Err(Error::InvalidChunk);
        }
        position = chunk_end;
    }
}
