use {axum::response::IntoResponse, hyper::StatusCode};

pub async fn handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
