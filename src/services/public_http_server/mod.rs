use {
    crate::state::AppState,
    axum::{
        http,
        routing::{get, post},
        Router,
    },
    std::{
        net::{IpAddr, SocketAddr},
        sync::Arc,
    },
    tower::ServiceBuilder,
    tower_http::{
        cors::{Any, CorsLayer},
        request_id::MakeRequestUuid,
        trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
        ServiceBuilderExt,
    },
    tracing::{info, Level},
};

pub mod handlers;

pub async fn start(bind_ip: IpAddr, port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let global_middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .propagate_x_request_id()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION]),
        );

    let app = Router::new()
        .route("/health", get(handlers::health::handler))
        .route("/metrics", get(handlers::metrics::handler))
        .route(
            "/v1/phones",
            post(handlers::phones::request_verification).patch(handlers::phones::submit_code),
        )
        .route(
            "/v1/relay_number",
            post(handlers::phones::provision_relay_number),
        )
        .route("/hooks/inbound_sms", post(handlers::inbound_sms::handler))
        .route("/hooks/inbound_call", post(handlers::inbound_call::handler))
        .layer(global_middleware)
        .with_state(state);

    let addr = SocketAddr::from((bind_ip, port));
    info!("Starting public HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}
