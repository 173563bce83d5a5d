use axum::{
    http::StatusCode,
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::like_store::{LikeRecord, LikeStoreError};
use crate::llm::predict;

pub fn api() -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/like", post(like))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
pub struct LikeRequest {
    instruction: String,
    response: String,
}

#[derive(Debug, Serialize)]
pub struct LikeResponse {
    status: &'static str,
    message: String,
}

/// Generation is synchronous and holds the model for its whole duration;
/// failures surface as a plain 500.
pub async fn chat(
    Extension(state): Extension<AppState>,
    Json(params): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, StatusCode> {
    let response = {
        let llm = state
            .llm
            .lock()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        predict::run(&params.message, &llm).map_err(|e| {
            tracing::error!(error = %e, "generation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
    };
    Ok(Json(ChatResponse { response }))
}

/// Always answers 200; callers inspect the `status` field.
pub async fn like(
    Extension(state): Extension<AppState>,
    Json(params): Json<LikeRequest>,
) -> Json<LikeResponse> {
    let record = LikeRecord {
        instruction: params.instruction,
        response: params.response,
    };
    Json(like_response(state.likes.append(record).await))
}

fn like_response(result: Result<usize, LikeStoreError>) -> LikeResponse {
    match result {
        Ok(count) => LikeResponse {
            status: "success",
            message: format!("Like saved ({count} total)"),
        },
        Err(e) => {
            tracing::error!(error = %e, "failed to persist like");
            LikeResponse {
                status: "error",
                message: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failure_maps_to_error_status() {
        let err = LikeStoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such directory",
        ));
        let resp = like_response(Err(err));
        assert_eq!(resp.status, "error");
        assert!(resp.message.contains("no such directory"));
    }

    #[test]
    fn successful_append_reports_count() {
        let resp = like_response(Ok(3));
        assert_eq!(resp.status, "success");
        assert!(resp.message.contains('3'));
    }
}
