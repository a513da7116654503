//! # Zapflow Channels
//! Outbound messaging. Everything wire-format related lives here so the
//! dispatch loop only ever sees `MessageSender::send_text`.

pub mod phone;
pub mod sender;
pub mod template;
pub mod whatsapp;

pub use phone::normalize_phone;
pub use sender::{MessageSender, SendError, SendReceipt};
pub use template::render_template;
pub use whatsapp::UazapiSender;
