//! SMTP server connection plumbing.
//!
//! This module provides the transport side of a session:
//! - Plaintext/TLS stream abstraction over any async byte stream
//! - The STARTTLS upgrader seam
//! - Framed line I/O with in-place re-framing after STARTTLS

mod framed;
mod stream;

pub use framed::FramedStream;
pub use stream::{BoxedTransport, HandshakeError, SmtpStream, StartTls, Transport};
