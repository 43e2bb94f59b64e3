//! Core SMTP types.

mod address;
mod extension;
mod reply;

pub use address::{extract_mailbox, parse_forward_path, parse_reverse_path};
pub use extension::{AuthMechanism, Extension};
pub use reply::{Reply, ReplyCode};
