//! Response middleware that expands custom elements in outgoing HTML.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::registry::ComponentRegistry;
use super::rewrite::rewrite_html;
use crate::error::Error;

/// axum middleware wrapping a downstream handler with component expansion.
///
/// Install with `axum::middleware::from_fn_with_state(registry, expand_middleware)`.
pub async fn expand_middleware(
    State(registry): State<Arc<ComponentRegistry>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    expand_response(&registry, response).await
}

/// Expand custom elements in a response when it qualifies.
///
/// Only `200` responses whose content-type begins with `text/html` are
/// buffered and rewritten; everything else -- other statuses, JSON,
/// event streams -- passes through untouched, bytes and backpressure
/// included. Components are never expanded in non-HTML responses.
pub async fn expand_response(registry: &ComponentRegistry, response: Response) -> Response {
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("text/html"))
        .unwrap_or(false);
    if response.status() != StatusCode::OK || !is_html {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("failed to buffer response body for expansion: {e}");
            return Error::Internal("response buffering failed".into()).into_response();
        }
    };

    if let Ok(text) = std::str::from_utf8(&bytes) {
        if let Some(rewritten) = rewrite_html(registry, text) {
            // Length changed; let the server recompute it.
            parts.headers.remove(header::CONTENT_LENGTH);
            return Response::from_parts(parts, Body::from(rewritten));
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::registry::{AttrMap, SlotMap};
    use axum::http::Request as HttpRequest;
    use axum::response::Html;
    use axum::routing::get;
    use axum::{Json, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn registry() -> Arc<ComponentRegistry> {
        let registry = ComponentRegistry::new("bk-");
        registry
            .register("bk-button", |attrs: &AttrMap, slots: &SlotMap| {
                let variant = attrs.get("variant").map(String::as_str).unwrap_or("default");
                let label = slots.get("default").map(String::as_str).unwrap_or("");
                Ok(format!("<button class=\"btn btn-{variant}\">{label}</button>"))
            })
            .unwrap();
        Arc::new(registry)
    }

    fn app(registry: Arc<ComponentRegistry>) -> Router {
        Router::new()
            .route(
                "/page",
                get(|| async {
                    Html("<html><body><bk-button variant=\"primary\">Go</bk-button></body></html>")
                }),
            )
            .route(
                "/json",
                get(|| async {
                    Json(serde_json::json!({"html": "<bk-button>X</bk-button>"}))
                }),
            )
            .route(
                "/missing",
                get(|| async {
                    (
                        StatusCode::NOT_FOUND,
                        Html("<p><bk-button>nope</bk-button></p>"),
                    )
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                registry,
                expand_middleware,
            ))
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_html_200_is_expanded() {
        let response = app(registry())
            .oneshot(HttpRequest::get("/page").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains("<button class=\"btn btn-primary\">Go</button>"));
        assert!(!text.contains("<bk-button"));
    }

    #[tokio::test]
    async fn test_json_passes_through_byte_identical() {
        let response = app(registry())
            .oneshot(HttpRequest::get("/json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let text = body_text(response).await;
        assert!(text.contains("<bk-button>X</bk-button>"));
    }

    #[tokio::test]
    async fn test_non_200_html_passes_through() {
        let response = app(registry())
            .oneshot(HttpRequest::get("/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let text = body_text(response).await;
        assert!(text.contains("<bk-button>nope</bk-button>"));
    }
}
