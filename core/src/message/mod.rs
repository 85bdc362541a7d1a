// Message module — outbound/inbound message records and delivery status

pub mod types;

pub use types::{
    AckToken, Destination, IncomingMessage, MessageId, MessageSource, MessageStatus,
    OutboundMessage, TextType, MAX_TEXT_BYTES,
};
