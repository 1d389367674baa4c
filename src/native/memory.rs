//! In-memory implementation of the native layer
//!
//! [`MemoryTdh`] answers TDH queries from event templates registered with a [`SchemaBuilder`], and
//! [`ReplayProcessor`] plays pre-recorded [`OwnedEventRecord`](crate::native::etw_types::OwnedEventRecord)s
//! as if they were delivered by a real-time session. Together they let the whole decoding and
//! consumption pipeline run without any OS support, e.g. to replay captured records or in tests.
use std::collections::HashMap;

use num_traits::FromPrimitive;

use crate::native::etw_types::{DecodingSource, EventRecord, Guid};
use crate::native::tdh::{
    FormatOutcome, FormatRequest, PropertyDataDescriptor, TdhBackend, TdhNativeError,
    TdhNativeResult, ERROR_INVALID_PARAMETER, WHOLE_PROPERTY,
};
use crate::native::tdh_types::{PropertyFlags, TdhOutType};

mod format;
pub mod replay;
mod schema_builder;

pub use replay::{ReplaySession, ReplayProcessor};
pub use schema_builder::{PropertyDef, SchemaBuilder, ValueMap};

struct RegisteredSchema {
    builder: SchemaBuilder,
    blob: Vec<u8>,
}

impl RegisteredSchema {
    fn matches(&self, record: &EventRecord) -> bool {
        let descriptor = &self.builder.descriptor;
        if self.builder.provider_guid != record.provider_id() || descriptor.version != record.version() {
            return false;
        }

        match self.builder.decoding_source {
            // Classic events are identified by their opcode
            DecodingSource::DecodingSourceWbem => descriptor.opcode == record.opcode(),
            _ => descriptor.id == record.event_id(),
        }
    }
}

/// Location of one property (or array element, or structure member) in the user data
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    name: String,
    /// Enclosing structure and element index, for structure members
    parent: Option<(String, u32)>,
    array_index: u32,
    offset: usize,
    size: usize,
}

/// A [`TdhBackend`] that knows the events registered with it
///
/// # Example
/// ```
/// use etwdecode::native::etw_types::{EventDescriptor, Guid};
/// use etwdecode::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder, ValueMap};
/// use etwdecode::native::tdh_types::{TdhInType, TdhOutType};
///
/// let provider = Guid::from_values(0x1234, 0, 0, [0; 8]);
/// let descriptor = EventDescriptor { id: 1, ..Default::default() };
/// let tdh = MemoryTdh::new()
///     .with_schema(
///         SchemaBuilder::new(provider, descriptor)
///             .property(PropertyDef::value("State", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull).with_map("States")),
///     )
///     .with_map(provider, ValueMap::value_map("States").entry(0, "Idle").entry(1, "Busy"));
/// ```
#[derive(Default)]
pub struct MemoryTdh {
    schemas: Vec<RegisteredSchema>,
    maps: HashMap<(Guid, String), Vec<u8>>,
}

impl MemoryTdh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event template. Later registrations of the same event take precedence
    pub fn with_schema(mut self, builder: SchemaBuilder) -> Self {
        self.register_schema(builder);
        self
    }

    pub fn with_map(mut self, provider: Guid, map: ValueMap) -> Self {
        self.register_map(provider, map);
        self
    }

    pub fn register_schema(&mut self, builder: SchemaBuilder) {
        let blob = builder.build();
        self.schemas.insert(0, RegisteredSchema { builder, blob });
    }

    pub fn register_map(&mut self, provider: Guid, map: ValueMap) {
        self.maps.insert((provider, map.name().to_owned()), map.build());
    }

    fn schema_for(&self, record: &EventRecord) -> TdhNativeResult<&RegisteredSchema> {
        self.schemas
            .iter()
            .find(|s| s.matches(record))
            .ok_or(TdhNativeError::NotFound)
    }

    /// Walks the user data the way TDH does, stopping at the first property it cannot size
    fn layout(&self, schema: &RegisteredSchema, record: &EventRecord) -> (Vec<Slot>, Option<TdhNativeError>) {
        let mut walk = LayoutWalk {
            defs: &schema.builder.properties,
            data: record.user_buffer(),
            pointer_size: record.pointer_size(),
            cursor: 0,
            slots: Vec::new(),
        };

        let top_level = schema.builder.top_level_count() as usize;
        for index in 0..top_level.min(walk.defs.len()) {
            if let Err(e) = walk.top_level(index) {
                return (walk.slots, Some(e));
            }
        }
        (walk.slots, None)
    }

    fn find_slot(
        &self,
        record: &EventRecord,
        path: &[PropertyDataDescriptor<'_>],
    ) -> TdhNativeResult<Slot> {
        let schema = self.schema_for(record)?;
        let (slots, error) = self.layout(schema, record);

        let found = match path {
            [p] => slots
                .iter()
                .find(|s| s.parent.is_none() && s.name == p.name && s.array_index == p.array_index),
            [parent, member] => slots.iter().find(|s| {
                s.parent.as_ref().map(|(n, i)| (n.as_str(), *i)) == Some((parent.name, parent.array_index))
                    && s.name == member.name
                    && s.array_index == member.array_index
            }),
            _ => None,
        };

        match (found, error) {
            (Some(slot), _) => Ok(slot.clone()),
            (None, Some(e)) => Err(e),
            (None, None) => Err(TdhNativeError::NotFound),
        }
    }
}

struct LayoutWalk<'a> {
    defs: &'a [PropertyDef],
    data: &'a [u8],
    pointer_size: u32,
    cursor: usize,
    slots: Vec<Slot>,
}

impl<'a> LayoutWalk<'a> {
    fn def(&self, index: usize) -> TdhNativeResult<&'a PropertyDef> {
        self.defs.get(index).ok_or(TdhNativeError::Os(ERROR_INVALID_PARAMETER))
    }

    /// Value of an already located integer property, looked up among the members of the current
    /// structure element first
    fn referenced_value(&self, index: u16, parent: Option<&(String, u32)>) -> TdhNativeResult<u64> {
        let name = &self.def(index as usize)?.name;
        let slot = self
            .slots
            .iter()
            .rev()
            .find(|s| &s.name == name && s.parent.as_ref() == parent && s.array_index == WHOLE_PROPERTY)
            .or_else(|| {
                self.slots
                    .iter()
                    .find(|s| &s.name == name && s.parent.is_none() && s.array_index == WHOLE_PROPERTY)
            })
            .ok_or(TdhNativeError::NotFound)?;

        let bytes = &self.data[slot.offset..slot.offset + slot.size];
        Ok(bytes
            .iter()
            .take(8)
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }

    fn count(&self, def: &PropertyDef, parent: Option<&(String, u32)>) -> TdhNativeResult<u32> {
        if def.flags.contains(PropertyFlags::PROPERTY_PARAM_COUNT) {
            Ok(self.referenced_value(def.count, parent)? as u32)
        } else {
            Ok(def.count as u32)
        }
    }

    fn value_slot(
        &mut self,
        def: &PropertyDef,
        parent: Option<&(String, u32)>,
        array_index: u32,
    ) -> TdhNativeResult<usize> {
        let length = if def.flags.contains(PropertyFlags::PROPERTY_PARAM_LENGTH) {
            self.referenced_value(def.length, parent)? as u16
        } else {
            def.length
        };

        let in_type = def
            .in_type()
            .ok_or(TdhNativeError::Os(ERROR_INVALID_PARAMETER))?;
        let out_type = TdhOutType::from_u16(def.type_b).unwrap_or(TdhOutType::OutTypeNull);
        let remaining = &self.data[self.cursor..];
        let size = format::value_size(in_type, out_type, length, self.pointer_size, remaining)?;

        self.slots.push(Slot {
            name: def.name.clone(),
            parent: parent.cloned(),
            array_index,
            offset: self.cursor,
            size,
        });
        self.cursor += size;
        Ok(size)
    }

    /// Locates a structure member, which can itself not be a structure
    fn member(&mut self, index: usize, parent: &(String, u32)) -> TdhNativeResult<()> {
        let def = self.def(index)?;
        if def.is_struct() {
            return Err(TdhNativeError::Os(ERROR_INVALID_PARAMETER));
        }

        let count = self.count(def, Some(parent))?;
        let start = self.cursor;
        for k in 0..count {
            self.value_slot(def, Some(parent), k)?;
        }
        self.slots.push(Slot {
            name: def.name.clone(),
            parent: Some(parent.clone()),
            array_index: WHOLE_PROPERTY,
            offset: start,
            size: self.cursor - start,
        });
        Ok(())
    }

    fn top_level(&mut self, index: usize) -> TdhNativeResult<()> {
        let def = self.def(index)?;
        let count = self.count(def, None)?;
        let start = self.cursor;

        for k in 0..count {
            if def.is_struct() {
                let element_start = self.cursor;
                let parent = (def.name.clone(), k);
                let first = def.type_a as usize;
                for member in first..first + def.type_b as usize {
                    self.member(member, &parent)?;
                }
                self.slots.push(Slot {
                    name: def.name.clone(),
                    parent: None,
                    array_index: k,
                    offset: element_start,
                    size: self.cursor - element_start,
                });
            } else {
                self.value_slot(def, None, k)?;
            }
        }

        self.slots.push(Slot {
            name: def.name.clone(),
            parent: None,
            array_index: WHOLE_PROPERTY,
            offset: start,
            size: self.cursor - start,
        });
        Ok(())
    }
}

impl TdhBackend for MemoryTdh {
    fn event_information(&self, record: &EventRecord, buffer: &mut [u8]) -> TdhNativeResult<u32> {
        let schema = self.schema_for(record)?;
        copy_blob(&schema.blob, buffer)
    }

    fn map_information(
        &self,
        record: &EventRecord,
        map_name: &str,
        buffer: &mut [u8],
    ) -> TdhNativeResult<u32> {
        let blob = self
            .maps
            .get(&(record.provider_id(), map_name.to_owned()))
            .ok_or(TdhNativeError::NotFound)?;
        copy_blob(blob, buffer)
    }

    fn format_property(
        &self,
        request: &FormatRequest<'_>,
        buffer: &mut [u16],
    ) -> TdhNativeResult<FormatOutcome> {
        let (text, consumed) = format::format_value(request)?;

        let units: Vec<u16> = text.encode_utf16().chain(std::iter::once(0)).collect();
        if units.len() > buffer.len() {
            return Err(TdhNativeError::InsufficientBuffer {
                required: units.len() as u32,
            });
        }
        buffer[..units.len()].copy_from_slice(&units);
        Ok(FormatOutcome { consumed })
    }

    fn property_size(
        &self,
        record: &EventRecord,
        path: &[PropertyDataDescriptor<'_>],
    ) -> TdhNativeResult<u32> {
        let slot = self.find_slot(record, path)?;
        Ok(slot.size as u32)
    }

    fn property(
        &self,
        record: &EventRecord,
        path: &[PropertyDataDescriptor<'_>],
        buffer: &mut [u8],
    ) -> TdhNativeResult<()> {
        let slot = self.find_slot(record, path)?;
        if buffer.len() < slot.size {
            return Err(TdhNativeError::InsufficientBuffer {
                required: slot.size as u32,
            });
        }
        buffer[..slot.size].copy_from_slice(&record.user_buffer()[slot.offset..slot.offset + slot.size]);
        Ok(())
    }
}

fn copy_blob(blob: &[u8], buffer: &mut [u8]) -> TdhNativeResult<u32> {
    if buffer.len() < blob.len() {
        return Err(TdhNativeError::InsufficientBuffer {
            required: blob.len() as u32,
        });
    }
    buffer[..blob.len()].copy_from_slice(blob);
    Ok(blob.len() as u32)
}
