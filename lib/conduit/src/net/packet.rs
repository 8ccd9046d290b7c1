use crate::net::stream::{ByteReader, ByteWriter};
use crate::net::support::{ErrorType, NetError, NetResult};
use hashbrown::HashMap;
use std::any::{Any, TypeId};
use std::sync::{Arc, RwLock};

/// A user-defined typed message carried inside a packet-bearing frame.
///
/// Packets know how to write themselves to a byte stream and how to fill
/// themselves back in from one; instances produced by the registry factory
/// start out in their default state and are populated by `read_from`. Once
/// decoded, packets are shared immutably across handler threads.
pub trait Packet: Send + Sync {
    fn write_to(&self, writer: &mut ByteWriter) -> NetResult<()>;
    fn read_from(&mut self, reader: &mut ByteReader) -> NetResult<()>;

    /// The serialized size in bytes when known in advance. A negative value
    /// means unknown and implies a growable encode buffer.
    #[inline]
    fn declared_size(&self) -> i32 {
        -1
    }

    fn as_any(&self) -> &dyn Any;
}

pub type PacketFactory = Arc<dyn Fn() -> Box<dyn Packet> + Send + Sync>;

struct Binding {
    factory: PacketFactory,
    type_name: &'static str,
}

/// Bidirectional mapping between a 32-bit wire tag and a concrete packet
/// type with its factory. Registration is write-once per tag and per type;
/// lookups only take read locks.
pub struct PacketRegistry {
    by_tag: RwLock<HashMap<u32, Binding>>,
    by_type: RwLock<HashMap<TypeId, u32>>,
}

impl PacketRegistry {
    #[inline]
    pub fn new() -> PacketRegistry {
        PacketRegistry {
            by_tag: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
        }
    }

    /// Register a packet type under the supplied tag. Duplicate registration
    /// of either the tag or the type is rejected.
    pub fn register<T>(&self, tag: u32) -> NetResult<()>
    where
        T: Packet + Default + 'static,
    {
        self.register_factory::<T>(tag, Arc::new(|| Box::new(T::default())))
    }

    /// Register with an explicit factory for packet types without a
    /// meaningful `Default`.
    pub fn register_factory<T>(&self, tag: u32, factory: PacketFactory) -> NetResult<()>
    where
        T: Packet + 'static,
    {
        let mut by_tag = self.by_tag.write().expect("Registry lock poisoned");
        let mut by_type = self.by_type.write().expect("Registry lock poisoned");

        if by_tag.contains_key(&tag) || by_type.contains_key(&TypeId::of::<T>()) {
            return Err(NetError::Fatal(ErrorType::DuplicateRegistration));
        }

        by_tag.insert(
            tag,
            Binding {
                factory,
                type_name: std::any::type_name::<T>(),
            },
        );
        by_type.insert(TypeId::of::<T>(), tag);

        Ok(())
    }

    /// Produce a fresh instance for the supplied tag, or `None` when the
    /// tag has no mapping.
    #[inline]
    pub fn create(&self, tag: u32) -> Option<Box<dyn Packet>> {
        let by_tag = self.by_tag.read().expect("Registry lock poisoned");
        by_tag.get(&tag).map(|binding| (binding.factory)())
    }

    /// The registered type name for a tag, for diagnostics.
    #[inline]
    pub fn type_name(&self, tag: u32) -> Option<&'static str> {
        let by_tag = self.by_tag.read().expect("Registry lock poisoned");
        by_tag.get(&tag).map(|binding| binding.type_name)
    }

    /// The wire tag for a packet instance, or `None` when its type was
    /// never registered.
    #[inline]
    pub fn tag_of(&self, packet: &dyn Packet) -> Option<u32> {
        let by_type = self.by_type.read().expect("Registry lock poisoned");
        by_type.get(&packet.as_any().type_id()).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_tag.read().expect("Registry lock poisoned").len()
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;

    /// Simple variable-size packet used across the crate's tests.
    #[derive(Debug, Default, Eq, PartialEq)]
    pub struct Probe {
        pub value: i32,
        pub label: String,
    }

    impl Packet for Probe {
        fn write_to(&self, writer: &mut ByteWriter) -> NetResult<()> {
            writer.write_int(self.value)?;
            writer.write_string_with_length(&self.label)
        }

        fn read_from(&mut self, reader: &mut ByteReader) -> NetResult<()> {
            self.value = reader.read_int()?;
            self.label = reader.read_string_with_length()?;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Fixed-size packet exercising the declared-size path.
    #[derive(Debug, Default, Eq, PartialEq)]
    pub struct Pulse {
        pub tick: i64,
    }

    impl Packet for Pulse {
        fn write_to(&self, writer: &mut ByteWriter) -> NetResult<()> {
            writer.write_long(self.tick)
        }

        fn read_from(&mut self, reader: &mut ByteReader) -> NetResult<()> {
            self.tick = reader.read_long()?;
            Ok(())
        }

        fn declared_size(&self) -> i32 {
            8
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}
