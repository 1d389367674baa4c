//! Builds `TRACE_EVENT_INFO` and `EVENT_MAP_INFO` blobs
use zerocopy::AsBytes;

use crate::native::etw_types::{DecodingSource, EventDescriptor, Guid, TemplateFlags};
use crate::native::tdh_types::{
    EventMapEntry, EventMapInfoHeader, EventPropertyInfo, PropertyFlags, TdhInType, TdhOutType,
    TraceEventInfoHeader, EVENTMAP_INFO_FLAG_MANIFEST_BITMAP, EVENTMAP_INFO_FLAG_MANIFEST_VALUEMAP,
};
use crate::traits::EncodeUtf16;

/// Definition of one property of an event template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    pub(crate) name: String,
    pub(crate) flags: PropertyFlags,
    /// In type, or struct start index
    pub(crate) type_a: u16,
    /// Out type, or struct member count
    pub(crate) type_b: u16,
    pub(crate) length: u16,
    pub(crate) count: u16,
    pub(crate) map_name: Option<String>,
}

impl PropertyDef {
    /// A plain value. Fixed-size types get their length filled in, as manifest compilers do
    pub fn value(name: &str, in_type: TdhInType, out_type: TdhOutType) -> Self {
        let length = in_type.static_size(8).unwrap_or(0) as u16;
        Self {
            name: name.to_owned(),
            flags: PropertyFlags::empty(),
            type_a: in_type as u16,
            type_b: out_type as u16,
            length,
            count: 1,
            map_name: None,
        }
    }

    /// A value whose in and out types may be unknown to this crate
    pub fn raw_value(name: &str, in_type: u16, out_type: u16, length: u16) -> Self {
        Self {
            name: name.to_owned(),
            flags: PropertyFlags::empty(),
            type_a: in_type,
            type_b: out_type,
            length,
            count: 1,
            map_name: None,
        }
    }

    /// A structure made of the properties `[start_index, start_index + member_count)`
    pub fn structure(name: &str, start_index: u16, member_count: u16) -> Self {
        Self {
            name: name.to_owned(),
            flags: PropertyFlags::PROPERTY_STRUCT,
            type_a: start_index,
            type_b: member_count,
            length: 0,
            count: 1,
            map_name: None,
        }
    }

    pub fn with_length(mut self, length: u16) -> Self {
        self.flags.remove(PropertyFlags::PROPERTY_PARAM_LENGTH);
        self.length = length;
        self
    }

    /// The length is the value of the property at `index`
    pub fn with_length_from(mut self, index: u16) -> Self {
        self.flags.insert(PropertyFlags::PROPERTY_PARAM_LENGTH);
        self.length = index;
        self
    }

    pub fn with_count(mut self, count: u16) -> Self {
        self.flags.remove(PropertyFlags::PROPERTY_PARAM_COUNT);
        self.count = count;
        self
    }

    /// A fixed-size array, even when `count` is 1
    pub fn with_fixed_count(mut self, count: u16) -> Self {
        self.flags.insert(PropertyFlags::PROPERTY_PARAM_FIXED_COUNT);
        self.count = count;
        self
    }

    /// The element count is the value of the property at `index`
    pub fn with_count_from(mut self, index: u16) -> Self {
        self.flags.insert(PropertyFlags::PROPERTY_PARAM_COUNT);
        self.count = index;
        self
    }

    pub fn with_map(mut self, map_name: &str) -> Self {
        self.map_name = Some(map_name.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_struct(&self) -> bool {
        self.flags.contains(PropertyFlags::PROPERTY_STRUCT)
    }

    pub(crate) fn in_type(&self) -> Option<TdhInType> {
        if self.is_struct() {
            None
        } else {
            num_traits::FromPrimitive::from_u16(self.type_a)
        }
    }
}

/// Builds the `TRACE_EVENT_INFO` of one event
///
/// # Example
/// ```
/// use etwdecode::native::etw_types::{EventDescriptor, Guid};
/// use etwdecode::native::memory::{PropertyDef, SchemaBuilder};
/// use etwdecode::native::tdh_types::{TdhInType, TdhOutType};
///
/// let descriptor = EventDescriptor { id: 1, ..Default::default() };
/// let blob = SchemaBuilder::new(Guid::from_values(1, 2, 3, [4; 8]), descriptor)
///     .provider_name("My-Provider")
///     .property(PropertyDef::value("Pid", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull))
///     .build();
/// assert!(blob.len() > 112);
/// ```
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    pub(crate) provider_guid: Guid,
    pub(crate) event_guid: Guid,
    pub(crate) descriptor: EventDescriptor,
    pub(crate) decoding_source: DecodingSource,
    pub(crate) template_flags: TemplateFlags,
    provider_name: Option<String>,
    level_name: Option<String>,
    channel_name: Option<String>,
    keywords_name: Option<String>,
    task_name: Option<String>,
    opcode_name: Option<String>,
    event_message: Option<String>,
    provider_message: Option<String>,
    activity_id_name: Option<String>,
    related_activity_id_name: Option<String>,
    pub(crate) properties: Vec<PropertyDef>,
    top_level_property_count: Option<u32>,
}

impl SchemaBuilder {
    pub fn new(provider_guid: Guid, descriptor: EventDescriptor) -> Self {
        Self {
            provider_guid,
            event_guid: Guid::zeroed(),
            descriptor,
            decoding_source: DecodingSource::DecodingSourceXMLFile,
            template_flags: TemplateFlags::empty(),
            provider_name: None,
            level_name: None,
            channel_name: None,
            keywords_name: None,
            task_name: None,
            opcode_name: None,
            event_message: None,
            provider_message: None,
            activity_id_name: None,
            related_activity_id_name: None,
            properties: Vec::new(),
            top_level_property_count: None,
        }
    }

    pub fn decoding_source(mut self, source: DecodingSource) -> Self {
        self.decoding_source = source;
        self
    }

    pub fn event_guid(mut self, guid: Guid) -> Self {
        self.event_guid = guid;
        self
    }

    pub fn template_flags(mut self, flags: TemplateFlags) -> Self {
        self.template_flags = flags;
        self
    }

    pub fn provider_name(mut self, name: &str) -> Self {
        self.provider_name = Some(name.to_owned());
        self
    }

    pub fn level_name(mut self, name: &str) -> Self {
        self.level_name = Some(name.to_owned());
        self
    }

    pub fn channel_name(mut self, name: &str) -> Self {
        self.channel_name = Some(name.to_owned());
        self
    }

    pub fn keywords_name(mut self, name: &str) -> Self {
        self.keywords_name = Some(name.to_owned());
        self
    }

    pub fn task_name(mut self, name: &str) -> Self {
        self.task_name = Some(name.to_owned());
        self
    }

    pub fn opcode_name(mut self, name: &str) -> Self {
        self.opcode_name = Some(name.to_owned());
        self
    }

    pub fn event_message(mut self, message: &str) -> Self {
        self.event_message = Some(message.to_owned());
        self
    }

    pub fn provider_message(mut self, message: &str) -> Self {
        self.provider_message = Some(message.to_owned());
        self
    }

    pub fn activity_id_name(mut self, name: &str) -> Self {
        self.activity_id_name = Some(name.to_owned());
        self
    }

    pub fn related_activity_id_name(mut self, name: &str) -> Self {
        self.related_activity_id_name = Some(name.to_owned());
        self
    }

    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Overrides the number of top-level properties
    ///
    /// By default, every property before the first structure member is a top-level property.
    pub fn top_level_property_count(mut self, count: u32) -> Self {
        self.top_level_property_count = Some(count);
        self
    }

    pub(crate) fn top_level_count(&self) -> u32 {
        self.top_level_property_count.unwrap_or_else(|| {
            self.properties
                .iter()
                .filter(|p| p.is_struct())
                .map(|p| p.type_a as u32)
                .min()
                .unwrap_or(self.properties.len() as u32)
        })
    }

    /// Serializes the `TRACE_EVENT_INFO`
    pub fn build(&self) -> Vec<u8> {
        let fixed_size = std::mem::size_of::<TraceEventInfoHeader>()
            + self.properties.len() * std::mem::size_of::<EventPropertyInfo>();
        let mut strings = StringTable::new(fixed_size);

        let mut header = TraceEventInfoHeader {
            provider_guid: self.provider_guid,
            event_guid: self.event_guid,
            event_descriptor: self.descriptor,
            decoding_source: self.decoding_source.into(),
            property_count: self.properties.len() as u32,
            top_level_property_count: self.top_level_count(),
            flags: self.template_flags.bits(),
            ..Default::default()
        };
        header.provider_name_offset = strings.push_opt(&self.provider_name);
        header.level_name_offset = strings.push_opt(&self.level_name);
        header.channel_name_offset = strings.push_opt(&self.channel_name);
        header.keywords_name_offset = strings.push_opt(&self.keywords_name);
        header.task_name_offset = strings.push_opt(&self.task_name);
        header.opcode_name_offset = strings.push_opt(&self.opcode_name);
        header.event_message_offset = strings.push_opt(&self.event_message);
        header.provider_message_offset = strings.push_opt(&self.provider_message);
        header.activity_id_name_offset = strings.push_opt(&self.activity_id_name);
        header.related_activity_id_name_offset = strings.push_opt(&self.related_activity_id_name);

        let infos: Vec<EventPropertyInfo> = self
            .properties
            .iter()
            .map(|p| EventPropertyInfo {
                flags: p.flags.bits(),
                name_offset: strings.push(&p.name),
                in_type_or_struct_start: p.type_a,
                out_type_or_member_count: p.type_b,
                map_name_offset: strings.push_opt(&p.map_name),
                count_or_index: p.count,
                length_or_index: p.length,
                tags: 0,
            })
            .collect();

        let mut blob = Vec::with_capacity(strings.end());
        blob.extend_from_slice(header.as_bytes());
        for info in &infos {
            blob.extend_from_slice(info.as_bytes());
        }
        blob.extend_from_slice(&strings.bytes);
        blob
    }
}

/// Definition of a value map (`valueMap` or `bitMap` in a manifest)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueMap {
    name: String,
    bitmap: bool,
    entries: Vec<(u32, String)>,
}

impl ValueMap {
    pub fn value_map(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            bitmap: false,
            entries: Vec::new(),
        }
    }

    pub fn bitmap(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            bitmap: true,
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, value: u32, output: &str) -> Self {
        self.entries.push((value, output.to_owned()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes the `EVENT_MAP_INFO`
    pub fn build(&self) -> Vec<u8> {
        let fixed_size = std::mem::size_of::<EventMapInfoHeader>()
            + self.entries.len() * std::mem::size_of::<EventMapEntry>();
        let mut strings = StringTable::new(fixed_size);

        let header = EventMapInfoHeader {
            name_offset: strings.push(&self.name),
            flag: if self.bitmap {
                EVENTMAP_INFO_FLAG_MANIFEST_BITMAP
            } else {
                EVENTMAP_INFO_FLAG_MANIFEST_VALUEMAP
            },
            entry_count: self.entries.len() as u32,
            value_type_or_format_offset: 0,
        };
        let entries: Vec<EventMapEntry> = self
            .entries
            .iter()
            .map(|(value, output)| EventMapEntry {
                output_offset: strings.push(output),
                value: *value,
            })
            .collect();

        let mut blob = Vec::with_capacity(strings.end());
        blob.extend_from_slice(header.as_bytes());
        for entry in &entries {
            blob.extend_from_slice(entry.as_bytes());
        }
        blob.extend_from_slice(&strings.bytes);
        blob
    }
}

/// NUL-terminated UTF-16 strings appended after a fixed part
struct StringTable {
    base: usize,
    bytes: Vec<u8>,
}

impl StringTable {
    fn new(base: usize) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    fn push(&mut self, s: &str) -> u32 {
        let offset = self.end() as u32;
        for unit in s.into_utf16() {
            self.bytes.extend_from_slice(&unit.to_le_bytes());
        }
        offset
    }

    fn push_opt(&mut self, s: &Option<String>) -> u32 {
        match s {
            Some(s) => self.push(s),
            None => 0,
        }
    }

    fn end(&self) -> usize {
        self.base + self.bytes.len()
    }
}
