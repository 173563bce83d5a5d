use tower_http::cors::{Any, CorsLayer};

/// Browser access is unrestricted: any origin, method, and header.
pub fn create_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
