//! First-pass request handler: forward to a deployment or fall through.
//!
//! Installed as an axum middleware around the API router. Requests the
//! routing table resolves are sent to `upstream_host:port` with the
//! resolved path and the original query string; everything else continues
//! to the API handlers.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::HOST;
use http::{HeaderValue, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::router::RoutingTable;

#[derive(Clone)]
pub struct Forwarder {
    table: RoutingTable,
    client: Client<HttpConnector, Body>,
    upstream_host: String,
}

impl Forwarder {
    pub fn new(table: RoutingTable) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            table,
            client,
            upstream_host: "127.0.0.1".to_string(),
        }
    }

    pub fn with_upstream_host(mut self, host: impl Into<String>) -> Self {
        self.upstream_host = host.into();
        self
    }
}

/// Middleware body; use with `axum::middleware::from_fn_with_state`.
pub async fn forward(State(fwd): State<Forwarder>, mut req: Request, next: Next) -> Response {
    let Some(target) = fwd.table.resolve(req.uri().path()) else {
        return next.run(req).await;
    };

    let path_query = match req.uri().query() {
        Some(query) => format!("{}?{query}", target.path),
        None => target.path.clone(),
    };
    let authority = format!("{}:{}", fwd.upstream_host, target.port);
    let uri = match Uri::try_from(format!("http://{authority}{path_query}")) {
        Ok(uri) => uri,
        Err(e) => {
            debug!(error = %e, "invalid upstream uri");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    debug!(deployment_id = %target.deployment_id, %uri, "forwarding request");
    *req.uri_mut() = uri;
    if let Ok(host) = HeaderValue::from_str(&authority) {
        req.headers_mut().insert(HOST, host);
    }

    match fwd.client.request(req).await {
        Ok(resp) => resp.into_response(),
        Err(err) => {
            warn!(deployment_id = %target.deployment_id, error = %err, "upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use stagehand_state::{Deployment, DeploymentStatus};
    use tower::ServiceExt;

    async fn upstream() -> u16 {
        let app = Router::new().fallback(|req: Request| async move {
            let pq = req
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default();
            format!("upstream saw {pq}")
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn ready(id: &str, port: u16, main: bool) -> Deployment {
        Deployment {
            id: id.to_string(),
            stage_id: id.to_string(),
            version: "v1".to_string(),
            env_tag: "prod".to_string(),
            port: Some(port),
            status: DeploymentStatus::Ready,
            log_path: String::new(),
            created_at: 1,
            promoted_at: main.then_some(1),
        }
    }

    fn app(table: RoutingTable) -> Router {
        Router::new()
            .route("/stagehand/meta/ping", get(|| async { "pong" }))
            .fallback(|| async { (StatusCode::NOT_FOUND, "api fallback") })
            .layer(axum::middleware::from_fn_with_state(Forwarder::new(table), forward))
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn stage_request_is_forwarded_with_prefix_stripped() {
        let port = upstream().await;
        let table = RoutingTable::new(["stagehand"]);
        table.upsert(&ready("v1-prod", port, false));

        let resp = app(table)
            .oneshot(http::Request::get("/v1-prod/users?page=2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "upstream saw /users?page=2");
    }

    #[tokio::test]
    async fn main_gets_full_path() {
        let port = upstream().await;
        let table = RoutingTable::new(["stagehand"]);
        table.upsert(&ready("v1-prod", port, true));

        let resp = app(table)
            .oneshot(http::Request::get("/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, "upstream saw /login");
    }

    #[tokio::test]
    async fn api_paths_fall_through() {
        let port = upstream().await;
        let table = RoutingTable::new(["stagehand"]);
        table.upsert(&ready("v1-prod", port, true));

        let resp = app(table)
            .oneshot(http::Request::get("/stagehand/meta/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, "pong");
    }

    #[tokio::test]
    async fn unrouted_paths_reach_api_fallback() {
        let resp = app(RoutingTable::new(["stagehand"]))
            .oneshot(http::Request::get("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dead_upstream_is_bad_gateway() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let table = RoutingTable::new(["stagehand"]);
        table.upsert(&ready("gone", port, false));
        let resp = app(table)
            .oneshot(http::Request::get("/gone/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
