use axum::{
    body::Body,
    http::{header, Response, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use rust_embed::Embed;

/// Embedded demo page and its assets
#[derive(Embed)]
#[folder = "web"]
pub struct StaticAssets;

/// Create router for static file serving
pub fn static_file_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/", get(index_handler))
        .route("/*path", get(static_handler))
}

async fn index_handler() -> Response<Body> {
    serve_file("index.html")
}

async fn static_handler(uri: Uri) -> Response<Body> {
    serve_file(uri.path().trim_start_matches('/'))
}

fn serve_file(path: &str) -> Response<Body> {
    match StaticAssets::get(path) {
        Some(asset) => {
            let mime = mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string();
            (
                [
                    (header::CONTENT_TYPE, mime),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                ],
                asset.data.into_owned(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}
