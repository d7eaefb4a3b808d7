//! HTTP/1.x request framing.
//!
//! This module parses request heads out of a connection buffer and decodes
//! request bodies framed with `content-length` or chunked transfer encoding.
//! Header names are normalized to lowercase and repeated headers are joined
//! with `", "`.

mod body;
mod error;
mod method;
mod request;
mod version;
mod tests;

// Re-export public items
pub use body::{decode_chunked, BodyFraming};
pub use error::Error;
pub use method::Method;
pub use request::{parse_request, parse_request_head, RequestHead, MAX_HEAD_SIZE};
pub use version::HttpVersion;
