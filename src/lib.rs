//! # playwire
//!
//! Asynchronous I/O substrate of a music-player remote-control server.
//!
//! - [`reactor`]: timers and cross-thread work hand-off bound to a
//!   cooperative event loop.
//! - [`transport`]: an HTTP transport driven by completions from a native
//!   listener service, with a fixed pool of request slots and streamed
//!   responses.
//! - [`server`]: ties the two together so requests are handled on the
//!   reactor.
//!
//! ## Quick Start
//!
//! ```rust
//! use playwire::http::{Body, RequestCore, Response, StatusCode};
//! use playwire::transport::HttpRequestQueue;
//! use playwire::transport::loopback::LoopbackService;
//! use playwire::transport::RequestEventListener;
//!
//! struct Hello;
//!
//! impl RequestEventListener for Hello {
//!     fn on_request_ready(&mut self, mut request: Box<dyn RequestCore>) {
//!         let path = request.path().to_owned();
//!         request.send_response_begin(Response::new(StatusCode::OK));
//!         request.send_response_body(Body::from("hello "));
//!         request.send_response_body(Body::from(path));
//!         request.send_response_end();
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = LoopbackService::new();
//! let mut queue = HttpRequestQueue::with_defaults(service.open_queue());
//! queue.set_listener(Hello);
//! queue.bind_prefix("/api/")?;
//! queue.start()?;
//!
//! let pending = service.get("/api/now-playing");
//! while queue.dispatch_pending() > 0 {}
//!
//! assert_eq!(pending.wait().await?.text(), "hello /api/now-playing");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod http;
pub mod reactor;
pub mod server;
pub mod transport;

pub use config::TransportConfig;
pub use http::{Body, Headers, Method, RequestCore, Response, StatusCode};
pub use server::{Server, ServerError};
pub use transport::{HttpRequestQueue, RequestEventListener};
