//! HTTP transport: packets are POSTed to `http://{address}/packet`
//!
//! The actix-web server exposes the packet endpoint together with a small
//! client API (`/push`, `/state/{key}`, `/info`, `/health`).

use super::{Transport, TransportError};
use crate::node::Node;
use crate::storage::Storage;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    inbound: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTransport {
            client,
            inbound: Arc::new(RwLock::new(None)),
        })
    }

    /// Hand bytes received by the server to the registered listener.
    pub async fn deliver(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let sender = self.inbound.read().clone().ok_or(TransportError::Closed)?;
        sender.send(bytes).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, address: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let response = self
            .client
            .post(format!("http://{}/packet", address))
            .header("content-type", "application/json")
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(address.to_string())
                } else if e.is_connect() {
                    TransportError::Unreachable(address.to_string())
                } else {
                    TransportError::Http(e)
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                address: address.to_string(),
                status: response.status().as_u16(),
            })
        }
    }

    fn listen(&self, inbound: mpsc::Sender<Vec<u8>>) {
        *self.inbound.write() = Some(inbound);
    }

    fn unlisten(&self) {
        self.inbound.write().take();
    }
}

type SharedNode<S> = web::Data<Arc<Node<HttpTransport, S>>>;

async fn receive_packet<S: Storage>(body: web::Bytes, node: SharedNode<S>) -> impl Responder {
    match node.transport().deliver(body.to_vec()).await {
        Ok(()) => HttpResponse::Accepted().finish(),
        Err(e) => {
            debug!(error = %e, "HTTP: packet dropped");
            HttpResponse::ServiceUnavailable().json(json!({"error": e.to_string()}))
        }
    }
}

async fn push<S: Storage>(command: web::Json<Value>, node: SharedNode<S>) -> impl Responder {
    match node.push(command.into_inner()) {
        Ok(command_id) => HttpResponse::Accepted().json(json!({"commandId": command_id})),
        Err(e) => {
            warn!(error = %e, "HTTP: push failed");
            HttpResponse::InternalServerError().json(json!({"error": e.to_string()}))
        }
    }
}

async fn get_state<S: Storage>(key: web::Path<String>, node: SharedNode<S>) -> impl Responder {
    match node.get_state(&key) {
        Ok(Some(value)) => HttpResponse::Ok().json(json!({"key": key.as_str(), "value": value})),
        Ok(None) => HttpResponse::NotFound().json(json!({"key": key.as_str()})),
        Err(e) => HttpResponse::InternalServerError().json(json!({"error": e.to_string()})),
    }
}

async fn node_info<S: Storage>(node: SharedNode<S>) -> impl Responder {
    match node.info() {
        Ok(info) => HttpResponse::Ok().json(info),
        Err(e) => HttpResponse::InternalServerError().json(json!({"error": e.to_string()})),
    }
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({"status": "healthy"}))
}

/// Serve the packet endpoint and client API until the server stops.
pub async fn start_server<S: Storage>(
    bind: String,
    node: Arc<Node<HttpTransport, S>>,
) -> std::io::Result<()> {
    let data = web::Data::new(node);
    info!(bind = %bind, "HTTP server starting");

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/packet", web::post().to(receive_packet::<S>))
            .route("/push", web::post().to(push::<S>))
            .route("/state/{key}", web::get().to(get_state::<S>))
            .route("/info", web::get().to(node_info::<S>))
            .route("/health", web::get().to(health))
    })
    .bind(bind)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_requires_listener() {
        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        assert!(matches!(
            transport.deliver(vec![1]).await,
            Err(TransportError::Closed)
        ));

        let (tx, mut rx) = mpsc::channel(1);
        transport.listen(tx);
        transport.deliver(vec![7]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![7]);

        transport.unlisten();
        assert!(transport.deliver(vec![8]).await.is_err());
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        assert!(transport.send("127.0.0.1:1", b"{}".to_vec()).await.is_err());
    }
}
