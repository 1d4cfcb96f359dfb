use {
    crate::{error::Result, state::AppState},
    axum::{
        extract::State,
        response::{IntoResponse, Response},
    },
    hyper::StatusCode,
    std::sync::Arc,
};

pub async fn handler(State(state): State<Arc<AppState>>) -> Result<Response> {
    if let Some(metrics) = &state.metrics {
        let exported = metrics.export()?;

        Ok((StatusCode::OK, exported).into_response())
    } else {
        Ok((StatusCode::BAD_REQUEST, "Metrics not enabled.".to_string()).into_response())
    }
}
