//! ETW Event Schema handler
//!
//! This module contains the means needed to retrieve the Schema of an ETW event, i.e. its
//! [TRACE_EVENT_INFO](https://learn.microsoft.com/en-us/windows/win32/api/tdh/ns-tdh-trace_event_info),
//! and to interact with it.
use std::collections::HashMap;

use once_cell::sync::Lazy;
use zerocopy::FromBytes;

use crate::native::etw_types::{DecodingSource, EventDescriptor, EventRecord, Guid, TemplateFlags};
use crate::native::tdh::{TdhBackend, TdhNativeError};
use crate::native::tdh_types::{EventPropertyInfo, Property, TraceEventInfoHeader};

/// Schema module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// TDH could not provide the metadata of this event
    MetadataUnavailable(TdhNativeError),
    /// An offset or an index points outside of the metadata block
    OutOfBounds { offset: usize, len: usize },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetadataUnavailable(e) => write!(f, "event metadata unavailable: {}", e),
            Self::OutOfBounds { offset, len } => {
                write!(f, "offset {} is out of the metadata block ({} bytes)", offset, len)
            }
        }
    }
}

impl std::error::Error for SchemaError {}

impl From<TdhNativeError> for SchemaError {
    fn from(err: TdhNativeError) -> Self {
        SchemaError::MetadataUnavailable(err)
    }
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// A class of kernel events described by MOF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MofClass {
    pub name: &'static str,
    /// Event ids of this class are `base_id + opcode`
    ///
    /// Neither ETW nor TDH define such an id. This crate numbers the classes in the order of its
    /// own table, `(index + 1) * 0x100`, so the value is only meaningful to etwdecode.
    pub base_id: u16,
}

// https://learn.microsoft.com/en-us/windows/win32/etw/event-tracing-mof-classes
// Keyed by the first 32 bits of the class GUID
const MOF_CLASSES: &[(u32, &str)] = &[
    (1171836109, "ALPC"),
    (2026983191, "ApplicationVerifier"),
    (328690953, "DbgPrint"),
    (1030727892, "DiskIo"),
    (3185075665, "DiskPerf"),
    (3580666929, "DriverVerifier"),
    (2976882526, "EventLog"),
    (25508453, "EventTraceConfig"),
    (2429279289, "FileIo"),
    (2369794079, "GenericMessage"),
    (3901786812, "GlobalLogger"),
    (1030727890, "HardFault"),
    (749821213, "ImageLoad"),
    (2560801239, "MsSystemInformation"),
    (1030727891, "PageFault"),
    (3458056116, "PerfInfo"),
    (1030727888, "Process"),
    (2924704302, "Registry"),
    (3627534994, "SplitIo"),
    (2586315456, "TcpIp"),
    (2713458880, "ThermalZone"),
    (1030727889, "Thread"),
    (964792796, "TraceError"),
    (3208270021, "UdpIp"),
    (1147177553, "WmiEventLogger"),
    (0x68fdd900, "EventTraceEvent"),
];

static MOF_CLASS_MAPPING: Lazy<HashMap<u32, MofClass>> = Lazy::new(|| {
    MOF_CLASSES
        .iter()
        .enumerate()
        .map(|(i, &(data1, name))| {
            let class = MofClass {
                name,
                base_id: (i as u16 + 1) * 0x100,
            };
            (data1, class)
        })
        .collect()
});

/// Looks up a MOF class by its GUID
pub fn mof_class(guid: &Guid) -> Option<MofClass> {
    MOF_CLASS_MAPPING.get(&guid.data1).copied()
}

const HEADER_SIZE: usize = std::mem::size_of::<TraceEventInfoHeader>();
const PROPERTY_INFO_SIZE: usize = std::mem::size_of::<EventPropertyInfo>();

/// An owned `TRACE_EVENT_INFO`
///
/// Every read is bounds-checked against the buffer TDH filled.
#[derive(Clone)]
pub struct TraceEventInfo {
    data: Vec<u8>,
    header: TraceEventInfoHeader,
}

impl TraceEventInfo {
    /// Asks TDH for the metadata of `record`
    ///
    /// The first call only tells the required size, the second one fills the buffer.
    pub fn build_from_event(backend: &dyn TdhBackend, record: &EventRecord) -> SchemaResult<Self> {
        let required = match backend.event_information(record, &mut []) {
            Err(TdhNativeError::InsufficientBuffer { required }) => required,
            Ok(_) => 0,
            Err(e) => return Err(SchemaError::MetadataUnavailable(e)),
        };

        let mut data = vec![0u8; required as usize];
        let written = backend.event_information(record, &mut data)?;
        data.truncate(written as usize);

        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> SchemaResult<Self> {
        let header =
            TraceEventInfoHeader::read_from_prefix(&data).ok_or(SchemaError::OutOfBounds {
                offset: HEADER_SIZE,
                len: data.len(),
            })?;
        Ok(Self { data, header })
    }

    /// The raw `TRACE_EVENT_INFO`
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn header(&self) -> &TraceEventInfoHeader {
        &self.header
    }

    fn slice(&self, offset: usize, size: usize) -> SchemaResult<&[u8]> {
        offset
            .checked_add(size)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(SchemaError::OutOfBounds {
                offset,
                len: self.data.len(),
            })
    }

    pub fn read_u16(&self, offset: usize) -> SchemaResult<u16> {
        let bytes = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&self, offset: usize) -> SchemaResult<u32> {
        let bytes = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, offset: usize) -> SchemaResult<u64> {
        let mut value = [0u8; 8];
        value.copy_from_slice(self.slice(offset, 8)?);
        Ok(u64::from_le_bytes(value))
    }

    pub fn read_guid(&self, offset: usize) -> SchemaResult<Guid> {
        Guid::read_from(self.slice(offset, std::mem::size_of::<Guid>())?).ok_or(
            SchemaError::OutOfBounds {
                offset,
                len: self.data.len(),
            },
        )
    }

    /// Reads the NUL-terminated UTF-16 string at `offset`, `0` meaning "no string"
    pub fn string_at(&self, offset: u32) -> SchemaResult<String> {
        if offset == 0 {
            return Ok(String::new());
        }

        let bytes = self.data.get(offset as usize..).ok_or(SchemaError::OutOfBounds {
            offset: offset as usize,
            len: self.data.len(),
        })?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();

        Ok(widestring::decode_utf16_lossy(units).collect())
    }

    /// Same as [`Self::string_at`], with surrounding spaces trimmed and errors degraded to an empty string
    fn name_at(&self, offset: u32) -> String {
        match self.string_at(offset) {
            Ok(s) => s.trim_matches(' ').to_owned(),
            Err(e) => {
                log::warn!("invalid name in event metadata: {}", e);
                String::new()
            }
        }
    }

    pub fn property_info(&self, index: u32) -> SchemaResult<EventPropertyInfo> {
        if index >= self.header.property_count {
            return Err(SchemaError::OutOfBounds {
                offset: index as usize,
                len: self.header.property_count as usize,
            });
        }

        let offset = HEADER_SIZE + index as usize * PROPERTY_INFO_SIZE;
        EventPropertyInfo::read_from(self.slice(offset, PROPERTY_INFO_SIZE)?).ok_or(
            SchemaError::OutOfBounds {
                offset,
                len: self.data.len(),
            },
        )
    }

    pub fn decoding_source(&self) -> DecodingSource {
        DecodingSource::from(self.header.decoding_source)
    }

    pub fn template_flags(&self) -> TemplateFlags {
        TemplateFlags::from_bits_truncate(self.header.flags)
    }

    pub fn provider_name(&self) -> String {
        self.name_at(self.header.provider_name_offset)
    }

    pub fn level_name(&self) -> String {
        self.name_at(self.header.level_name_offset)
    }

    pub fn channel_name(&self) -> String {
        self.name_at(self.header.channel_name_offset)
    }

    pub fn keywords_name(&self) -> String {
        self.name_at(self.header.keywords_name_offset)
    }

    pub fn task_name(&self) -> String {
        self.name_at(self.header.task_name_offset)
    }

    pub fn opcode_name(&self) -> String {
        self.name_at(self.header.opcode_name_offset)
    }

    pub fn event_message(&self) -> String {
        self.name_at(self.header.event_message_offset)
    }

    pub fn provider_message(&self) -> String {
        self.name_at(self.header.provider_message_offset)
    }

    pub fn activity_id_name(&self) -> String {
        self.name_at(self.header.activity_id_name_offset)
    }

    pub fn related_activity_id_name(&self) -> String {
        self.name_at(self.header.related_activity_id_name_offset)
    }
}

impl std::fmt::Debug for TraceEventInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEventInfo")
            .field("len", &self.data.len())
            .field("header", &self.header)
            .finish()
    }
}

/// The Schema of an ETW event
///
/// This structure holds a [TraceEventInfo] along with the [Property] descriptors it contains,
/// parsed once when the schema is built.
#[derive(Debug, Clone)]
pub struct Schema {
    info: TraceEventInfo,
    properties: Vec<Property>,
}

impl Schema {
    /// Retrieves the schema of `record` from TDH
    ///
    /// # Example
    /// ```
    /// # use etwdecode::native::etw_types::{EventDescriptor, EventHeader, Guid, OwnedEventRecord};
    /// # use etwdecode::native::memory::{MemoryTdh, SchemaBuilder};
    /// # use etwdecode::schema::Schema;
    /// let provider = Guid::from_values(1, 2, 3, [4; 8]);
    /// let tdh = MemoryTdh::new().with_schema(
    ///     SchemaBuilder::new(provider, EventDescriptor::default()).provider_name("My-Provider "),
    /// );
    ///
    /// let mut header = EventHeader::default();
    /// header.provider_id = provider;
    /// let record = OwnedEventRecord::new(header, Vec::new());
    ///
    /// let schema = Schema::from_record(&tdh, &record).unwrap();
    /// assert_eq!(schema.provider_name(), "My-Provider");
    /// ```
    pub fn from_record(backend: &dyn TdhBackend, record: &EventRecord) -> SchemaResult<Self> {
        let info = TraceEventInfo::build_from_event(backend, record)?;
        Self::from_info(info)
    }

    pub fn from_info(info: TraceEventInfo) -> SchemaResult<Self> {
        let properties = (0..info.header().property_count)
            .map(|i| {
                let raw = info.property_info(i)?;
                let name = info.string_at(raw.name_offset)?;
                let map_name = info.string_at(raw.map_name_offset)?;
                Ok(Property::new(name, &raw, Some(map_name)))
            })
            .collect::<SchemaResult<Vec<_>>>()?;

        Ok(Self { info, properties })
    }

    pub fn info(&self) -> &TraceEventInfo {
        &self.info
    }

    /// The event descriptor, as known by the metadata
    pub fn event_descriptor(&self) -> &EventDescriptor {
        &self.info.header().event_descriptor
    }

    pub fn provider_guid(&self) -> Guid {
        self.info.header().provider_guid
    }

    /// The class GUID of MOF events, zero otherwise
    pub fn event_guid(&self) -> Guid {
        self.info.header().event_guid
    }

    pub fn decoding_source(&self) -> DecodingSource {
        self.info.decoding_source()
    }

    pub fn is_mof(&self) -> bool {
        self.decoding_source() == DecodingSource::DecodingSourceWbem
    }

    pub fn is_xml(&self) -> bool {
        self.decoding_source() == DecodingSource::DecodingSourceXMLFile
    }

    /// Whether the properties are a user-data template rather than event data
    pub fn is_user_data_template(&self) -> bool {
        self.info
            .template_flags()
            .contains(TemplateFlags::TEMPLATE_USER_DATA)
    }

    /// The MOF class of this event, if it is a MOF event of a known class
    pub fn mof_class(&self) -> Option<MofClass> {
        if self.is_mof() {
            mof_class(&self.event_guid())
        } else {
            None
        }
    }

    /// Event id, as meaningful as the decoding source allows
    ///
    /// MOF events get one derived from their class and opcode, or `0` when the class is unknown.
    /// Every other source carries it in the event descriptor.
    pub fn event_id(&self) -> u16 {
        match self.decoding_source() {
            DecodingSource::DecodingSourceWbem => self
                .mof_class()
                .map(|c| c.base_id + self.event_descriptor().opcode as u16)
                .unwrap_or(0),
            _ => self.event_descriptor().id,
        }
    }

    /// `<Class>/<Opcode>` for MOF events, `None` otherwise
    pub fn event_type(&self) -> Option<String> {
        if !self.is_mof() {
            return None;
        }
        let class = self.mof_class().map(|c| c.name).unwrap_or("UnknownClass");
        Some(format!("{}/{}", class, self.opcode_name()))
    }

    pub fn provider_name(&self) -> String {
        self.info.provider_name()
    }

    pub fn channel_name(&self) -> String {
        self.info.channel_name()
    }

    pub fn level_name(&self) -> String {
        self.info.level_name()
    }

    /// See: [OpcodeType](https://docs.microsoft.com/en-us/windows/win32/wes/eventmanifestschema-opcodetype-complextype)
    pub fn opcode_name(&self) -> String {
        self.info.opcode_name()
    }

    /// See: [TaskType](https://docs.microsoft.com/en-us/windows/win32/wes/eventmanifestschema-tasktype-complextype)
    pub fn task_name(&self) -> String {
        self.info.task_name()
    }

    pub fn keywords_name(&self) -> String {
        self.info.keywords_name()
    }

    pub fn event_message(&self) -> String {
        self.info.event_message()
    }

    pub fn activity_id_name(&self) -> String {
        self.info.activity_id_name()
    }

    pub fn related_activity_id_name(&self) -> String {
        self.info.related_activity_id_name()
    }

    pub fn property_count(&self) -> u32 {
        self.properties.len() as u32
    }

    pub fn top_level_property_count(&self) -> u32 {
        self.info
            .header()
            .top_level_property_count
            .min(self.property_count())
    }

    pub fn property(&self, index: u32) -> SchemaResult<&Property> {
        self.properties
            .get(index as usize)
            .ok_or(SchemaError::OutOfBounds {
                offset: index as usize,
                len: self.properties.len(),
            })
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.provider_guid() == other.provider_guid()
            && self.event_descriptor().id == other.event_descriptor().id
            && self.event_descriptor().version == other.event_descriptor().version
    }
}

impl Eq for Schema {}
