//! HTTP server: builder, accept loop, graceful stop
//!
//! hyper http1 served directly off a `TcpListener`, one task per connection,
//! upgrades enabled for the WebSocket route. The accept loop stops when the
//! broker's shutdown token fires; in-flight connections wind down through the
//! broker's own drain.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use flowcast_broker::EventBroker;

use crate::handler::FlowcastHandler;
use crate::{HttpServerError, Result};

/// Configuration for the HTTP server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_address: SocketAddr,
    /// Origin allowed for cross-origin browser clients; `None` disables the
    /// CORS headers entirely, `"*"` allows any origin
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8787".parse().unwrap(),
            cors_origin: Some("*".to_string()),
        }
    }
}

/// Builder for the Flowcast HTTP server
pub struct FlowcastServerBuilder {
    config: ServerConfig,
    broker: Arc<EventBroker>,
}

impl FlowcastServerBuilder {
    pub fn with_broker(broker: Arc<EventBroker>) -> Self {
        Self {
            config: ServerConfig::default(),
            broker,
        }
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Toggle CORS with the permissive `"*"` origin
    pub fn cors(mut self, enable: bool) -> Self {
        self.config.cors_origin = enable.then(|| "*".to_string());
        self
    }

    /// Restrict CORS to one origin
    pub fn cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.cors_origin = Some(origin.into());
        self
    }

    pub fn build(self) -> FlowcastServer {
        FlowcastServer {
            config: Arc::new(self.config),
            broker: self.broker,
        }
    }
}

/// The Flowcast HTTP server
#[derive(Clone)]
pub struct FlowcastServer {
    config: Arc<ServerConfig>,
    broker: Arc<EventBroker>,
}

impl FlowcastServer {
    pub fn builder(broker: Arc<EventBroker>) -> FlowcastServerBuilder {
        FlowcastServerBuilder::with_broker(broker)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(HttpServerError::Bind)?;
        self.serve(listener).await
    }

    /// Serve on an existing listener until the broker's shutdown token fires
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "flowcast server listening on {}",
            listener.local_addr().map_err(HttpServerError::Io)?
        );
        info!("event store backend: {}", self.broker.store_backend());

        let handler = FlowcastHandler::new(Arc::clone(&self.broker), Arc::clone(&self.config));
        let shutdown = self.broker.shutdown_token();

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => accepted.map_err(HttpServerError::Io)?,
                _ = shutdown.cancelled() => {
                    info!("accept loop stopping");
                    break;
                }
            };
            debug!("new connection from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, hyper::Error>(handler.handle(req).await) }
                });

                // with_upgrades keeps the connection alive through the
                // WebSocket protocol switch
                let connection = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades();
                if let Err(err) = connection.await {
                    let text = err.to_string();
                    if text.contains("connection closed before message completed") {
                        debug!("client disconnected: {}", err);
                    } else {
                        error!("error serving connection: {}", err);
                    }
                }
            });
        }

        Ok(())
    }
}
