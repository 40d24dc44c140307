//! HTTP surface for webhook callbacks.

use crate::dispatcher::{WebhookDispatcher, WebhookRequest};
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{header, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use wecom_types::error::WecomResult;

/// Router sending every path to the dispatcher, which resolves targets itself.
pub fn webhook_router(dispatcher: Arc<WebhookDispatcher>) -> Router {
    Router::new()
        .fallback(handle_webhook)
        .with_state(dispatcher)
}

async fn handle_webhook(
    State(dispatcher): State<Arc<WebhookDispatcher>>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let request = WebhookRequest::new(method, uri.path(), query.as_deref(), body.to_vec());
    let response = dispatcher.handle(request).await;
    (
        response.status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response()
}

/// Serve the webhook router on `addr` until `shutdown` flips to true.
pub async fn serve(
    addr: SocketAddr,
    dispatcher: Arc<WebhookDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> WecomResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, paths = ?dispatcher.paths(), "Webhook HTTP server listening");

    let server = axum::serve(listener, webhook_router(dispatcher));
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                warn!("Webhook server error: {e}");
                return Err(e.into());
            }
        }
        _ = shutdown.changed() => {
            info!("Webhook server shutting down");
        }
    }

    info!("Webhook HTTP server stopped");
    Ok(())
}
