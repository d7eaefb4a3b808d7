//! Static file serving with cache validation.
//!
//! [`serve_file`] maps a request resource below a root directory, answers
//! `if-none-match` and `if-modified-since` with 304, and emits `etag`,
//! `last-modified`, `cache-control`, `content-length` and `content-type`.
//! Directory listings are not produced.

mod tests;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::parser::Method;
use crate::server::{HandlerFuture, Request, RequestHandler, Response, StatusCode};

pub const DEFAULT_CACHE_CONTROL: &str = "private,max-age=0,must-revalidate";

/// Seconds a client is asked to wait when the file system is saturated.
const RETRY_AFTER_SECS: u32 = 1;

// errno values without a stable `io::ErrorKind`
const EBUSY: i32 = 16;
const ENOTDIR: i32 = 20;
const EISDIR: i32 = 21;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// How files are served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOptions {
    pub cache_control: String,
    pub etag: bool,
    pub last_modified: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            cache_control: DEFAULT_CACHE_CONTROL.to_string(),
            etag: true,
            last_modified: true,
        }
    }
}

/// A file could not be served.
#[derive(Debug, Error)]
pub enum FileSystemError {
    #[error("forbidden path")]
    Forbidden,

    #[error("permission denied")]
    PermissionDenied,

    #[error("file not found")]
    NotFound,

    /// The file is busy or the process ran out of file descriptors.
    #[error("file system busy: {0}")]
    Busy(io::Error),

    #[error("directory where a file was expected")]
    IsDirectory,

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl FileSystemError {
    /// Classify an error raised while opening or reading a file.
    pub fn from_io(error: io::Error) -> Self {
        match error.raw_os_error() {
            Some(EBUSY | ENFILE | EMFILE) => return FileSystemError::Busy(error),
            Some(ENOTDIR) => return FileSystemError::NotFound,
            Some(EISDIR) => return FileSystemError::IsDirectory,
            _ => {}
        }
        match error.kind() {
            io::ErrorKind::PermissionDenied => FileSystemError::PermissionDenied,
            io::ErrorKind::NotFound => FileSystemError::NotFound,
            _ => FileSystemError::Io(error),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            FileSystemError::Forbidden | FileSystemError::PermissionDenied => StatusCode::FORBIDDEN,
            FileSystemError::NotFound => StatusCode::NOT_FOUND,
            FileSystemError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            FileSystemError::IsDirectory | FileSystemError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The response sent for this error.
    pub fn to_response(&self) -> Response {
        let response = Response::text(self.status(), self.to_string());
        match self {
            FileSystemError::Busy(_) => response.with_header("retry-after", RETRY_AFTER_SECS.to_string()),
            _ => response,
        }
    }
}

/// Content type for a file name, from its extension.
pub fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Map `resource` to a path below `root`.
///
/// The query string is dropped and `%XX` escapes are decoded. Segments
/// that could leave `root` are rejected.
pub fn resolve_path(root: &Path, resource: &str) -> Result<PathBuf, FileSystemError> {
    let path = resource.split(['?', '#']).next().unwrap_or_default();
    let decoded = percent_decode(path).ok_or(FileSystemError::Forbidden)?;

    let mut resolved = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(FileSystemError::Forbidden),
            segment if segment.contains(['\\', '\0']) => return Err(FileSystemError::Forbidden),
            segment => resolved.push(segment),
        }
    }
    Ok(resolved)
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = input.get(index + 1..index + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else {
            decoded.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |since| since.as_secs())
}

/// Whether the client's cached copy is still current.
fn is_fresh(headers: &HashMap<String, String>, etag: &str, modified_secs: u64) -> bool {
    if let Some(if_none_match) = headers.get("if-none-match") {
        return if_none_match
            .split(',')
            .map(|tag| tag.trim().trim_start_matches("W/"))
            .any(|tag| tag == "*" || tag == etag);
    }
    if let Some(if_modified_since) = headers.get("if-modified-since") {
        if let Ok(since) = httpdate::parse_http_date(if_modified_since) {
            return modified_secs <= unix_seconds(since);
        }
    }
    false
}

/// Serve the file `resource` names below `root`.
///
/// `headers` are the request headers keyed by lowercase name. Errors are
/// answered with the status [`FileSystemError::status`] gives them.
pub async fn serve_file(
    root: &Path,
    resource: &str,
    headers: &HashMap<String, String>,
    options: &FileOptions,
) -> Response {
    match try_serve_file(root, resource, headers, options).await {
        Ok(response) => response,
        Err(error) => error.to_response(),
    }
}

async fn try_serve_file(
    root: &Path,
    resource: &str,
    headers: &HashMap<String, String>,
    options: &FileOptions,
) -> Result<Response, FileSystemError> {
    let path = resolve_path(root, resource)?;
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(FileSystemError::from_io)?;
    if metadata.is_dir() {
        return Err(FileSystemError::Forbidden);
    }

    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
    let modified_secs = unix_seconds(modified);
    let etag = format!("\"{}-{}\"", metadata.len(), modified_secs);

    let mut validators = Vec::new();
    if options.etag {
        validators.push(("etag", etag.clone()));
    }
    if options.last_modified {
        let last_modified = UNIX_EPOCH + Duration::from_secs(modified_secs);
        validators.push(("last-modified", httpdate::fmt_http_date(last_modified)));
    }
    validators.push(("cache-control", options.cache_control.clone()));

    let response = if is_fresh(headers, &etag, modified_secs) {
        Response::new(StatusCode::NOT_MODIFIED)
    } else {
        let contents = tokio::fs::read(&path)
            .await
            .map_err(FileSystemError::from_io)?;
        Response::new(StatusCode::OK)
            .with_content_type(content_type(&path))
            .with_body_bytes(contents)
    };
    Ok(validators
        .into_iter()
        .fold(response, |response, (name, value)| response.with_header(name, value)))
}

/// A handler serving `GET` and `HEAD` requests from `root`.
///
/// Missing files and other methods get no response, so the handler can be
/// combined with others through [`first_handler`](crate::server::first_handler).
pub fn file_handler(root: impl Into<PathBuf>, options: FileOptions) -> RequestHandler {
    let root: Arc<Path> = Arc::from(root.into());
    let options = Arc::new(options);
    Arc::new(move |request: Request| -> HandlerFuture {
        let root = root.clone();
        let options = options.clone();
        Box::pin(async move {
            if !matches!(request.method, Method::GET | Method::HEAD) {
                return Ok(None);
            }
            let response = serve_file(&root, &request.resource, &request.headers, &options).await;
            if response.status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            Ok(Some(response))
        })
    })
}
