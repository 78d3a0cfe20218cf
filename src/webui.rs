//! Embedded admin UI shell. The files under `webui/` are compiled into the
//! binary so the gateway ships as a single executable.

use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};

const INDEX_HTML: &str = include_str!("../webui/index.html");
const VITE_SVG: &str = include_str!("../webui/vite.svg");
const INDEX_CSS: &str = include_str!("../webui/assets/index.css");
const INDEX_JS: &str = include_str!("../webui/assets/index.js");

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn vite_svg() -> Response {
    ([(header::CONTENT_TYPE, "image/svg+xml")], VITE_SVG).into_response()
}

pub async fn asset(Path(path): Path<String>) -> Response {
    match path.as_str() {
        "index.css" => ([(header::CONTENT_TYPE, "text/css")], INDEX_CSS).into_response(),
        "index.js" => (
            [(header::CONTENT_TYPE, "text/javascript")],
            INDEX_JS,
        )
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
