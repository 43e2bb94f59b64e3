//! # mailledger-smtpd
//!
//! Server-side SMTP protocol engine implementing RFC 5321 sessions.
//!
//! ## Features
//!
//! - **Session state machine**: HELO/EHLO, MAIL, RCPT, DATA, RSET, QUIT with
//!   strict command ordering
//! - **STARTTLS**: in-place upgrade that never replays plaintext buffered
//!   before the handshake (RFC 3207)
//! - **Authentication**: PLAIN and LOGIN over TLS, CRAM-MD5 everywhere
//!   (RFC 4954)
//! - **Streaming DATA**: the message body is handed to the application as a
//!   dot-unstuffed reader, never buffered whole
//!
//! The engine does not listen on sockets, queue or relay mail. Those are left
//! to the application, which plugs in through the [`Handler`] trait.
//!
//! ## Quick Start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use mailledger_smtpd::{Config, Handler, HandlerError, Server};
//! use tokio::io::{AsyncRead, AsyncReadExt};
//! use tokio::net::TcpListener;
//!
//! struct Sink;
//!
//! #[async_trait]
//! impl Handler for Sink {
//!     async fn message(
//!         &mut self,
//!         body: &mut (dyn AsyncRead + Unpin + Send),
//!     ) -> Result<(), HandlerError> {
//!         let mut data = Vec::new();
//!         body.read_to_end(&mut data)
//!             .await
//!             .map_err(|e| HandlerError::temporary(e.to_string()))?;
//!         println!("received {} bytes", data.len());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Server::new(Config::builder("mx.example.com").pipelining(true).build());
//!     let listener = TcpListener::bind("127.0.0.1:2525").await?;
//!
//!     loop {
//!         let (stream, peer) = listener.accept().await?;
//!         let server = server.clone();
//!         tokio::spawn(async move {
//!             let _ = server.serve(stream, peer.to_string(), Sink).await;
//!         });
//!     }
//! }
//! ```
//!
//! ## Session Flow
//!
//! ```text
//! ┌─────────┐  220  ┌───────┐  MAIL  ┌────────┐  RCPT  ┌───────────┐
//! │ Connect │ ────→ │ Ready │ ─────→ │ Sender │ ─────→ │ Recipient │
//! └─────────┘       └───────┘        └────────┘        └───────────┘
//!                       ▲                                    │ DATA
//!                       └──────── 250 / error, RSET ─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`command`]: Command line parsing
//! - [`connection`]: Plaintext/TLS transport and line framing
//! - [`data`]: Dot-unstuffing body reader
//! - [`sasl`]: PLAIN, LOGIN and CRAM-MD5 helpers
//! - [`types`]: Replies, extensions and address extraction

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod config;
pub mod connection;
pub mod data;
mod error;
pub mod handler;
pub mod sasl;
pub mod server;
pub mod session;
pub mod types;

pub use config::{Config, ConfigBuilder};
pub use connection::StartTls;
pub use error::{Error, HandlerError, Result, Severity};
pub use handler::{Handler, NoopHandler};
pub use server::Server;
pub use session::Session;
pub use types::{Reply, ReplyCode};
