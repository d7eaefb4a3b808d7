//! Cross-origin resource sharing headers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::parser::Method;

/// Which cross-origin requests are allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessControlConfig {
    /// Origins always allowed; `"*"` allows any.
    pub allowed_origins: Vec<String>,
    /// Reflect the request `origin` header.
    pub allow_request_origin: bool,
    pub allowed_methods: Vec<String>,
    /// Reflect the preflight `access-control-request-method` header.
    pub allow_request_method: bool,
    pub allowed_headers: Vec<String>,
    /// Reflect the preflight `access-control-request-headers` header.
    pub allow_request_headers: bool,
    pub allow_credentials: bool,
    /// Seconds a preflight answer may be cached.
    pub max_age: Option<u64>,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_request_origin: false,
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allow_request_method: false,
            allowed_headers: vec!["x-requested-with".to_string()],
            allow_request_headers: false,
            allow_credentials: false,
            max_age: Some(600),
        }
    }
}

/// Whether the request is a CORS preflight.
pub fn is_preflight(method: Method, headers: &HashMap<String, String>) -> bool {
    method == Method::OPTIONS && headers.contains_key("access-control-request-method")
}

/// Compute the `access-control-*` and `vary` headers answering a request.
///
/// `request_headers` must be keyed by lowercase name. An `origin` not
/// covered by the configuration gets no `access-control-allow-origin`.
/// With credentials allowed a wildcard origin is answered with the request
/// origin, and without a request origin the credentials header is left out.
pub fn access_control_headers(
    request_headers: &HashMap<String, String>,
    config: &AccessControlConfig,
) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    let mut vary: Vec<&str> = Vec::new();
    let request_origin = request_headers.get("origin");

    let wildcard = config.allowed_origins.iter().any(|origin| origin == "*");
    let mut credentials = config.allow_credentials;
    let allow_origin = match request_origin {
        Some(origin) if config.allow_request_origin || config.allowed_origins.contains(origin) => {
            vary.push("origin");
            Some(origin.clone())
        }
        Some(origin) if wildcard && credentials => {
            vary.push("origin");
            Some(origin.clone())
        }
        _ if wildcard => {
            credentials = false;
            Some("*".to_string())
        }
        _ => None,
    };
    if let Some(origin) = allow_origin {
        headers.push(("access-control-allow-origin".to_string(), origin));
    }

    let mut methods = config.allowed_methods.clone();
    if config.allow_request_method {
        if let Some(method) = request_headers.get("access-control-request-method") {
            let method = method.trim().to_ascii_uppercase();
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(&method)) {
                methods.push(method);
            }
            vary.push("access-control-request-method");
        }
    }
    if !methods.is_empty() {
        headers.push(("access-control-allow-methods".to_string(), methods.join(", ")));
    }

    let mut allowed = config.allowed_headers.clone();
    if config.allow_request_headers {
        if let Some(requested) = request_headers.get("access-control-request-headers") {
            for name in requested.split(',').map(str::trim).filter(|name| !name.is_empty()) {
                if !allowed.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                    allowed.push(name.to_ascii_lowercase());
                }
            }
            vary.push("access-control-request-headers");
        }
    }
    if !allowed.is_empty() {
        headers.push(("access-control-allow-headers".to_string(), allowed.join(", ")));
    }

    if credentials {
        headers.push(("access-control-allow-credentials".to_string(), "true".to_string()));
    }
    if let Some(max_age) = config.max_age {
        headers.push(("access-control-max-age".to_string(), max_age.to_string()));
    }
    if !vary.is_empty() {
        headers.push(("vary".to_string(), vary.join(", ")));
    }
    headers
}
