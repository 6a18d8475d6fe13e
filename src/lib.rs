//! A client-side HTTP/2 message I/O engine.
//!
//! One [`Connection`] drives one HTTP/2 connection: it multiplexes many
//! concurrent request/response exchanges (here called *messages*, see
//! [`message`]) over a single bidirectional byte stream. The wire protocol
//! itself — framing, HPACK, per-frame validation — is delegated to the `h2`
//! crate, which plays the role of an external codec session; this crate is
//! the glue around it: the per-message state machine, the request body
//! pump, and the response body stream.
//!
//! See `DESIGN.md` for how each component here maps back to the engine this
//! was distilled from, and to the teacher crate's original structure.
//!
//! # Example
//!
//! ```no_run
//! use h2engine::{Connection, config::Config};
//! use http::{HeaderMap, Method};
//!
//! # async fn run(io: tokio::net::TcpStream) -> h2engine::Result<()> {
//! let mut conn = Connection::handshake(io, Config::default()).await?;
//!
//! let item = h2engine::connection::OutgoingRequest {
//!     method: Method::GET,
//!     scheme: "https",
//!     authority: "example.com:443".to_string(),
//!     path: "/".to_string(),
//!     query: None,
//!     headers: HeaderMap::new(),
//!     body: None,
//!     metrics: None,
//! };
//!
//! let msg = conn.submit(item, Box::new(|_completion| {})).await?;
//! conn.run_until(msg, h2engine::message::State::ReadData).await?;
//! let _body = conn.get_response_istream(msg);
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod metrics;

pub use connection::{Connection, OutgoingRequest};
pub use error::{Error, Result};
pub use message::{Completion, CompletionCallback, Message, MessageId, State};
pub use metrics::{Metrics, MetricsHandle};
