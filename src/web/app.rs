use super::{MAX_IMAGE_SIZE_BYTES, handlers};
use crate::engine::EngineHandle;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{IntoMakeService, post},
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::Level;

pub(crate) fn router(engine: EngineHandle) -> Router {
    Router::new()
        // The one and only operation: source face onto destination image
        .route("/swapper", post(handlers::swap_faces))
        // Apply a layer to limit the maximum size of request bodies
        .layer(DefaultBodyLimit::max(MAX_IMAGE_SIZE_BYTES))
        // Add CORS layer for broader client compatibility
        .layer(CorsLayer::permissive())
        // Add tracing for HTTP requests and responses
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::INFO)))
        // Provide the shared engine handle
        .with_state(engine)
}

pub fn create_app(engine: EngineHandle) -> IntoMakeService<Router> {
    router(engine).into_make_service()
}
