//! The `/events` HTTP endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use futures::{stream, StreamExt};

use super::broker::EventBroker;
use crate::error::Error;

/// Build a router exposing the event stream on the configured path.
pub fn sse_routes(broker: Arc<EventBroker>, path: &str) -> Router {
    Router::new()
        .route(path, get(sse_stream))
        .with_state(broker)
}

/// Upgrade the request to a `text/event-stream` response.
///
/// axum's [`Sse`] writes the required headers (`Content-Type:
/// text/event-stream`, `Cache-Control: no-cache`, keep-alive). The stream
/// opens with a `: connected` comment, then emits frames from the
/// subscriber's channel until the client disconnects or the broker shuts
/// down; heartbeats arrive through the same channel as comment frames.
///
/// Dropping the stream (client gone) unsubscribes from the broker.
pub async fn sse_stream(
    State(broker): State<Arc<EventBroker>>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, Error> {
    let subscriber = broker.subscribe().await?;

    let opening = stream::once(async { Ok(Event::default().comment("connected")) });
    let deliveries = subscriber.map(|delivery| Ok(delivery.into_event()));

    Ok(Sse::new(opening.chain(deliveries)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SseConfig;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_broker() -> Arc<EventBroker> {
        Arc::new(EventBroker::new(SseConfig {
            path: "/events".to_string(),
            heartbeat_secs: 3600,
            subscriber_buffer: 8,
        }))
    }

    #[tokio::test]
    async fn test_stream_headers_and_first_frames() {
        let broker = test_broker();
        let app = sse_routes(broker.clone(), "/events");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        broker.broadcast("update", "<div>x</div>").await.unwrap();
        // Stats round-trips the command channel, so the broadcast has been
        // fanned out before shutdown races it.
        let _ = broker.stats().await.unwrap();
        broker.shutdown(Duration::from_secs(1)).await;

        // With the broker shut down the stream terminates, so the whole
        // body can be collected.
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with(": connected"));
        assert!(text.contains("event: update\ndata: <div>x</div>\n\n"));
    }

    #[tokio::test]
    async fn test_stream_refused_during_shutdown() {
        let broker = test_broker();
        broker.shutdown(Duration::from_secs(1)).await;

        let app = sse_routes(broker, "/events");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
