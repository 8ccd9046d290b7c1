pub use crate::config::{Config, ConfigBuilder};
pub use crate::event::{
    ConnectionClosedEvent, ConnectionOpenedEvent, Event, PacketRejectedEvent, Priority,
};
pub use crate::handler::{PacketContext, PacketHandler};
pub use crate::manager::NetworkManager;
pub use crate::net::connection::{CloseReason, Connection, ConnectionState};
pub use crate::net::identity::{ConnectionType, Features, NetworkId, ServerType};
pub use crate::net::packet::{Packet, PacketRegistry};
pub use crate::net::stream::{ByteReader, ByteWriter};
pub use crate::net::support::{ErrorType, ErrorUtils, NetError, NetResult, Side};
