mod routes_api;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::{Extension, Router};
use tower_http::services::{ServeDir, ServeFile};

use crate::like_store::LikeStore;
use crate::llm::ChatLlm;
use crate::middleware::cors::create_cors;

/// Everything the handlers need, constructed once in `main` and injected.
#[derive(Clone)]
pub struct AppState {
    pub llm: Arc<Mutex<ChatLlm>>,
    pub likes: Arc<LikeStore>,
}

pub fn create_routes(state: AppState, ui_dir: Option<PathBuf>) -> Router {
    let cors = create_cors();
    let mut router = routes_api::api();
    if let Some(dir) = ui_dir {
        router = router
            .route_service("/", ServeFile::new(dir.join("index.html")))
            .nest_service("/ui", ServeDir::new(dir));
    }
    router.layer(Extension(state)).layer(cors)
}
