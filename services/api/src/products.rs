//! Product catalog endpoints.
//!
//! Placeholders for the storefront frontend: lookup and add acknowledge the
//! request without touching a catalog store.

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::api::{AppState, MessageResponse};

#[derive(Debug, Serialize)]
struct ProductResponse {
    success: bool,
    data: &'static str,
}

/// Product routes, mounted under the service root.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/product/slider-advertis", get(get_product))
        .route("/api/v1/product/add", post(add_product))
}

async fn get_product() -> Json<ProductResponse> {
    Json(ProductResponse {
        success: true,
        data: "Product found",
    })
}

async fn add_product() -> (StatusCode, Json<MessageResponse>) {
    (
        StatusCode::CREATED,
        Json(MessageResponse::new("Product added successfully")),
    )
}
