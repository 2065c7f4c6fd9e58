pub mod reliable;
pub mod reorder;
pub mod udp;

pub use reliable::{ReliableStats, ReliableTransport};
pub use reorder::{ReorderBuffer, ReorderStats};
pub use udp::{TransportError, TransportStats, UdpTransport};
