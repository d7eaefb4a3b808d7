//! Tests for static file serving.

#[cfg(test)]
mod files_tests {
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use crate::files::{
        content_type, file_handler, resolve_path, serve_file, FileOptions, FileSystemError, DEFAULT_CACHE_CONTROL,
    };
    use crate::parser::Method;
    use crate::server::{Body, Request, StatusCode};

    fn body_of(body: &Body) -> &[u8] {
        match body {
            Body::Full(bytes) => bytes,
            _ => &[],
        }
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(dir.path().join("hello world.txt"), "spaced").unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets").join("app.js"), "run()").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_serves_file_with_validators() {
        let dir = site();
        let response = serve_file(dir.path(), "/index.html", &HashMap::new(), &FileOptions::default()).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body_of(&response.body), b"<h1>hi</h1>");
        assert_eq!(response.header("content-type"), Some("text/html; charset=utf-8"));
        assert_eq!(response.header("content-length"), Some("11"));
        assert_eq!(response.header("cache-control"), Some(DEFAULT_CACHE_CONTROL));
        assert!(response.header("etag").unwrap().starts_with("\"11-"));
        assert!(response.header("last-modified").is_some());
    }

    #[tokio::test]
    async fn test_nested_and_escaped_paths() {
        let dir = site();
        let options = FileOptions::default();

        let response = serve_file(dir.path(), "/assets/app.js?v=3", &HashMap::new(), &options).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("content-type"), Some("text/javascript; charset=utf-8"));

        let response = serve_file(dir.path(), "/hello%20world.txt", &HashMap::new(), &options).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body_of(&response.body), b"spaced");
    }

    #[tokio::test]
    async fn test_if_none_match_returns_304() {
        let dir = site();
        let options = FileOptions::default();
        let first = serve_file(dir.path(), "/index.html", &HashMap::new(), &options).await;
        let etag = first.header("etag").unwrap().to_string();

        let headers = HashMap::from([("if-none-match".to_string(), etag.clone())]);
        let response = serve_file(dir.path(), "/index.html", &headers, &options).await;
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert_eq!(response.header("etag"), Some(etag.as_str()));
        assert!(response.body.is_empty());

        // Weak comparison and lists are honoured
        let headers = HashMap::from([("if-none-match".to_string(), format!("\"other\", W/{etag}"))]);
        let response = serve_file(dir.path(), "/index.html", &headers, &options).await;
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);

        let headers = HashMap::from([("if-none-match".to_string(), "\"stale\"".to_string())]);
        let response = serve_file(dir.path(), "/index.html", &headers, &options).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_if_modified_since() {
        let dir = site();
        let options = FileOptions::default();

        let later = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(3600));
        let headers = HashMap::from([("if-modified-since".to_string(), later)]);
        let response = serve_file(dir.path(), "/index.html", &headers, &options).await;
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);

        let earlier = httpdate::fmt_http_date(SystemTime::UNIX_EPOCH + Duration::from_secs(86_400));
        let headers = HashMap::from([("if-modified-since".to_string(), earlier)]);
        let response = serve_file(dir.path(), "/index.html", &headers, &options).await;
        assert_eq!(response.status, StatusCode::OK);

        // An unparsable date is ignored
        let headers = HashMap::from([("if-modified-since".to_string(), "yesterday".to_string())]);
        let response = serve_file(dir.path(), "/index.html", &headers, &options).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_file_returns_404() {
        let dir = site();
        let response = serve_file(dir.path(), "/nope.txt", &HashMap::new(), &FileOptions::default()).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        // A file used as a directory is missing too
        let response = serve_file(dir.path(), "/index.html/more", &HashMap::new(), &FileOptions::default()).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_and_directories_are_forbidden() {
        let dir = site();
        let options = FileOptions::default();

        let response = serve_file(dir.path(), "/../etc/passwd", &HashMap::new(), &options).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);

        let response = serve_file(dir.path(), "/assets/%2e%2e/%2e%2e/secret", &HashMap::new(), &options).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);

        let response = serve_file(dir.path(), "/assets", &HashMap::new(), &options).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);

        assert!(matches!(resolve_path(dir.path(), "/bad%zz"), Err(FileSystemError::Forbidden)));
    }

    #[tokio::test]
    async fn test_io_error_classification() {
        let busy = FileSystemError::from_io(io::Error::from_raw_os_error(24));
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(busy.to_response().header("retry-after"), Some("1"));

        let denied = FileSystemError::from_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let directory = FileSystemError::from_io(io::Error::from_raw_os_error(21));
        assert_eq!(directory.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let other = FileSystemError::from_io(io::Error::new(io::ErrorKind::Other, "disk on fire"));
        assert_eq!(other.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_content_types() {
        assert_eq!(content_type(Path::new("style.CSS")), "text/css; charset=utf-8");
        assert_eq!(content_type(Path::new("logo.svg")), "image/svg+xml");
        assert_eq!(content_type(Path::new("archive.tar.gz")), "application/octet-stream");
        assert_eq!(content_type(Path::new("Makefile")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_file_handler_defers_unknown_requests() {
        let dir = site();
        let handler = file_handler(dir.path(), FileOptions::default());

        let response = handler(Request::new(Method::GET, "http://localhost", "/index.html")).await.unwrap();
        assert_eq!(response.unwrap().status, StatusCode::OK);

        let response = handler(Request::new(Method::GET, "http://localhost", "/missing")).await.unwrap();
        assert!(response.is_none());

        let response = handler(Request::new(Method::POST, "http://localhost", "/index.html")).await.unwrap();
        assert!(response.is_none());
    }
}
