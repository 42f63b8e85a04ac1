//! The server front: a request queue whose requests are handled on the reactor.
//!
//! The transport dispatches completions wherever [`Server::run`] is polled.
//! Each ready request is handed across to the reactor through its
//! [`WorkQueue`], so the handler, and any timers it arms, always run on the
//! reactor's own execution context.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, TransportConfig};
use crate::http::{RequestCore, RequestToken};
use crate::reactor::{TokioTimerFactory, TokioWorkQueue, WorkQueue};
use crate::transport::{
    HttpRequestQueue, NativeQueue, PoolStats, RequestEventListener, RequestOutcome,
    TransportError,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// A request queue bound to a reactor.
///
/// # Examples
///
/// ```rust,no_run
/// use playwire::config::TransportConfig;
/// use playwire::http::{RequestCore, Response, StatusCode};
/// use playwire::server::Server;
/// use playwire::transport::loopback::LoopbackService;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = LoopbackService::new();
///     let config = TransportConfig {
///         prefixes: vec!["/api/".to_owned()],
///         ..TransportConfig::default()
///     };
///     let server = Server::bind(service.open_queue(), &config, tokio::runtime::Handle::current())?;
///
///     server
///         .run(
///             |mut request: Box<dyn RequestCore>| {
///                 request.send_response(Response::new(StatusCode::OK).body("playing"));
///             },
///             async { tokio::signal::ctrl_c().await.unwrap_or_default() },
///         )
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    queue: HttpRequestQueue,
    work: Arc<TokioWorkQueue>,
    reactor: Handle,
}

impl Server {
    /// Validates `config`, creates the request queue on `native` and binds
    /// the configured prefixes.
    pub fn bind(
        native: Arc<dyn NativeQueue>,
        config: &TransportConfig,
        reactor: Handle,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let mut queue = HttpRequestQueue::new(native, config)?;
        for prefix in &config.prefixes {
            queue.bind_prefix(prefix)?;
        }

        Ok(Self {
            queue,
            work: Arc::new(TokioWorkQueue::new(reactor.clone())),
            reactor,
        })
    }

    /// Binds one more prefix before the server runs.
    pub fn bind_prefix(&mut self, prefix: &str) -> Result<(), ServerError> {
        self.queue.bind_prefix(prefix)?;
        Ok(())
    }

    /// Timers whose callbacks run on this server's reactor.
    pub fn timer_factory(&self) -> TokioTimerFactory {
        TokioTimerFactory::new(self.reactor.clone())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.queue.pool_stats()
    }

    /// Serves requests until `shutdown` resolves, then drains the queue.
    ///
    /// `handler` runs on the reactor once per request. It may answer
    /// immediately or move the request elsewhere and stream the response
    /// later; a request dropped without a response is aborted.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Transport`] if the queue cannot be started.
    pub async fn run<H, S>(mut self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Box<dyn RequestCore>) + Send + Sync + 'static,
        S: Future<Output = ()>,
    {
        let work: Arc<dyn WorkQueue> = self.work.clone();
        self.queue.set_listener(Bridge {
            handler: Arc::new(handler),
            work,
        });
        self.queue.start()?;
        info!(
            prefixes = ?self.queue.prefixes().collect::<Vec<_>>(),
            capacity = self.queue.capacity(),
            "playwire serving"
        );

        self.queue.run_until(shutdown).await?;

        info!("shutting down");
        self.queue.shutdown().await;
        Ok(())
    }
}

/// Forwards ready requests onto the reactor.
struct Bridge<H> {
    handler: Arc<H>,
    work: Arc<dyn WorkQueue>,
}

impl<H> RequestEventListener for Bridge<H>
where
    H: Fn(Box<dyn RequestCore>) + Send + Sync + 'static,
{
    fn on_request_ready(&mut self, request: Box<dyn RequestCore>) {
        debug!(
            token = %request.token(),
            method = %request.method(),
            path = request.path(),
            "dispatching request"
        );
        let handler = Arc::clone(&self.handler);
        self.work.enqueue(Box::new(move || handler(request)));
    }

    fn on_request_done(&mut self, token: RequestToken, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Completed => debug!(%token, "response sent"),
            RequestOutcome::Aborted => warn!(%token, "request aborted"),
        }
    }
}
