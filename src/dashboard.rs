//! Minimal dashboard stub. The embedded dashboard UI proper is out of
//! scope; this serves a single static page pointing at the telemetry API
//! and `/events` stream so the route exists and is discoverable.

use axum::response::{Html, IntoResponse};

const PAGE: &str = r#"<!doctype html>
<html>
<head><title>ollama-ctx-proxy</title></head>
<body>
<h1>ollama-ctx-proxy</h1>
<p>Dashboard UI is not built into this binary. Query the telemetry API directly:</p>
<ul>
<li><a href="/overview">/overview</a></li>
<li><a href="/requests">/requests</a></li>
<li><a href="/models">/models</a></li>
<li><a href="/events">/events</a> (Server-Sent Events)</li>
<li><a href="/metrics">/metrics</a> (Prometheus)</li>
</ul>
</body>
</html>"#;

pub async fn dashboard_handler() -> impl IntoResponse {
    Html(PAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dashboard_handler_returns_html() {
        let response = dashboard_handler().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
