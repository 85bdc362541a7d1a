// Transport module — contract with the companion radio link

pub mod abstraction;

pub use abstraction::{
    ChannelInfo, ReceivedText, RemoteStatus, SentInfo, Transport, TransportError,
    TransportEvent,
};
