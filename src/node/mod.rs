pub mod registry;
pub mod transport;

pub use registry::{MembershipEvent, Peer, PeerRegistry};
pub use transport::{InboundSender, LoopbackTransport, PeerMessage, PeerTransport, SerializedTask};
