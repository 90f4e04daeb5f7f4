//! HTTP-framework-agnostic endpoint registration.
//!
//! Components register handlers here; the serving mux lives outside the
//! engine and adapts registered handlers into its own routes. Paths may end
//! in a single `{name}` segment, matched against exactly one extra path
//! segment at dispatch time.

use parking_lot::RwLock;
use std::sync::Arc;

/// A request passed to a registered handler.
#[derive(Debug, Clone)]
pub struct EndpointRequest {
    /// HTTP method, uppercase.
    pub method: String,
    /// Full request path.
    pub path: String,
    /// Request body.
    pub body: Vec<u8>,
}

/// A response returned by a registered handler.
#[derive(Debug, Clone)]
pub struct EndpointResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl EndpointResponse {
    /// 200 response with a body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// Response with an arbitrary status and body.
    pub fn status(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Handler invoked for a matching request.
pub type EndpointHandler = Arc<dyn Fn(EndpointRequest) -> EndpointResponse + Send + Sync>;

/// A registered endpoint.
#[derive(Clone)]
pub struct RegisteredEndpoint {
    /// Path pattern, optionally ending in `{name}`.
    pub path: String,
    /// Human-readable description served by discovery listings.
    pub description: String,
    handler: EndpointHandler,
}

/// Registry of endpoints exposed by engine components.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<Vec<RegisteredEndpoint>>,
}

impl EndpointRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler under a path pattern. A later registration for the
    /// same pattern replaces the earlier one.
    pub fn register(
        &self,
        path: impl Into<String>,
        description: impl Into<String>,
        handler: EndpointHandler,
    ) {
        let path = path.into();
        let mut endpoints = self.endpoints.write();
        endpoints.retain(|e| e.path != path);
        endpoints.push(RegisteredEndpoint {
            path,
            description: description.into(),
            handler,
        });
    }

    /// List registered path patterns and descriptions.
    pub fn list(&self) -> Vec<(String, String)> {
        self.endpoints
            .read()
            .iter()
            .map(|e| (e.path.clone(), e.description.clone()))
            .collect()
    }

    /// Dispatch a request to the first matching endpoint, exact matches
    /// preferred over `{name}` patterns. Returns `None` when no endpoint
    /// matches.
    pub fn dispatch(&self, method: &str, path: &str, body: Vec<u8>) -> Option<EndpointResponse> {
        let endpoints = self.endpoints.read();

        let handler = endpoints
            .iter()
            .find(|e| e.path == path)
            .or_else(|| endpoints.iter().find(|e| pattern_matches(&e.path, path)))
            .map(|e| Arc::clone(&e.handler))?;
        drop(endpoints);

        Some(handler(EndpointRequest {
            method: method.to_uppercase(),
            path: path.to_string(),
            body,
        }))
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    let Some(prefix) = pattern.strip_suffix("{name}") else {
        return false;
    };
    match path.strip_prefix(prefix) {
        Some(rest) => !rest.is_empty() && !rest.contains('/'),
        None => false,
    }
}
