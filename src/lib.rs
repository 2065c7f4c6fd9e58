pub mod device_registry;
pub mod identity;
pub mod instance;
pub mod mesh;
pub mod packet;
pub mod router;
pub mod routing;
pub mod rules;
pub mod transport;
pub mod uuid_registry;

pub use device_registry::{Device, DeviceKey, DeviceRegistry, DeviceRegistryError, Provenance};
pub use identity::{NodeId, NodeIdentity};
pub use instance::{InstanceDirectory, InstanceError};
pub use mesh::{MeshError, MeshHandle, MeshNode, MeshStats};
pub use packet::{ForwardingContext, Packet, PacketError, PacketFlags, MAX_HOPS};
pub use router::{LocalOutputSink, MidiRouter, RouterStats};
pub use routing::{Route, RoutingTable};
pub use rules::{ForwardingRule, RuleEngine, RuleError};
pub use uuid_registry::{NodeHash, RegistryError, UuidRegistry};
