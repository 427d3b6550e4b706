use axum::{
    extract::Path,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use mime_guess::mime;
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "assets"]
struct Assets;

/// Routes for the bundled viewer page and its static files.
pub fn ui_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/static/*path", get(asset))
}

async fn index() -> Response {
    match Assets::get("index.html") {
        Some(content) => {
            let body = String::from_utf8_lossy(content.data.as_ref()).into_owned();
            let mut res = Html(body).into_response();
            res.headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            res
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn asset(Path(path): Path<String>) -> Response {
    serve_file(&path)
}

fn serve_file(path: &str) -> Response {
    let Some(content) = Assets::get(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime == mime::TEXT_JAVASCRIPT {
        mime = mime::APPLICATION_JAVASCRIPT;
    }
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    // assets are not fingerprinted
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    (headers, content.data.into_owned()).into_response()
}
