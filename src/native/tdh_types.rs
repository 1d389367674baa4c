//! Basic TDH types
//!
//! The `tdh_type` module provides an abstraction over the basic TDH types, this module act as a
//! helper for the parser to determine which IN and OUT type are expected from a property within an
//! event
//!
//! This is a bit extra but is basically a redefinition of the In an Out TDH types following the
//! rust naming convention. The raw [EventPropertyInfo] is the descriptor exactly as TDH lays it
//! out, [Property] is its parsed counterpart.
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::native::etw_types::{EventDescriptor, Guid};

/// Fixed part of [TRACE_EVENT_INFO](https://learn.microsoft.com/en-us/windows/win32/api/tdh/ns-tdh-trace_event_info)
///
/// The array of [EventPropertyInfo] starts right after it, strings are stored further in the same
/// buffer and are referenced by their offset from the start of the structure.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromZeroes, FromBytes, AsBytes)]
pub struct TraceEventInfoHeader {
    pub provider_guid: Guid,
    pub event_guid: Guid,
    pub event_descriptor: EventDescriptor,
    pub decoding_source: i32,
    pub provider_name_offset: u32,
    pub level_name_offset: u32,
    pub channel_name_offset: u32,
    pub keywords_name_offset: u32,
    pub task_name_offset: u32,
    pub opcode_name_offset: u32,
    pub event_message_offset: u32,
    pub provider_message_offset: u32,
    pub binary_xml_offset: u32,
    pub binary_xml_size: u32,
    /// Union with `EventNameOffset`
    pub activity_id_name_offset: u32,
    /// Union with `EventAttributesOffset`
    pub related_activity_id_name_offset: u32,
    pub property_count: u32,
    pub top_level_property_count: u32,
    pub flags: u32,
}

/// Fixed part of [EVENT_MAP_INFO](https://learn.microsoft.com/en-us/windows/win32/api/tdh/ns-tdh-event_map_info)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromZeroes, FromBytes, AsBytes)]
pub struct EventMapInfoHeader {
    pub name_offset: u32,
    pub flag: u32,
    pub entry_count: u32,
    /// Union of `MapEntryValueType` and `FormatStringOffset`
    pub value_type_or_format_offset: u32,
}

/// Mirror of [EVENT_MAP_ENTRY](https://learn.microsoft.com/en-us/windows/win32/api/tdh/ns-tdh-event_map_entry)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromZeroes, FromBytes, AsBytes)]
pub struct EventMapEntry {
    pub output_offset: u32,
    /// Union of `Value` and `InputOffset`
    pub value: u32,
}

/// `EVENTMAP_INFO_FLAG_MANIFEST_VALUEMAP`
pub const EVENTMAP_INFO_FLAG_MANIFEST_VALUEMAP: u32 = 0x1;
/// `EVENTMAP_INFO_FLAG_MANIFEST_BITMAP`
pub const EVENTMAP_INFO_FLAG_MANIFEST_BITMAP: u32 = 0x2;

/// Mirror of [EVENT_PROPERTY_INFO](https://learn.microsoft.com/en-us/windows/win32/api/tdh/ns-tdh-event_property_info)
///
/// The unions of the Windows definition are flattened into their raw halves, [Property] gives
/// them a meaning depending on the flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct EventPropertyInfo {
    pub flags: u32,
    pub name_offset: u32,
    /// `InType`, or `StructStartIndex` for structures
    pub in_type_or_struct_start: u16,
    /// `OutType`, or `NumOfStructMembers` for structures
    pub out_type_or_member_count: u16,
    /// `MapNameOffset` (or `CustomSchemaOffset`)
    pub map_name_offset: u32,
    /// `count` or `countPropertyIndex`
    pub count_or_index: u16,
    /// `length` or `lengthPropertyIndex`
    pub length_or_index: u16,
    pub tags: u32,
}

/// What a property holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// A plain value, formatted by TDH according to its raw in and out types
    Value { in_type: u16, out_type: u16 },
    /// A structure, whose members are the properties `[start_index, start_index + member_count)`
    Struct { start_index: u16, member_count: u16 },
}

/// How the length of a property is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyLength {
    Length(u16),
    /// Given at runtime by the value of another property
    Index(u16),
}

/// How the element count of a property is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyCount {
    Count(u16),
    /// Given at runtime by the value of another property
    Index(u16),
}

/// Attributes of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Name of the Property
    pub name: String,
    /// Represent the [PropertyFlags]
    pub flags: PropertyFlags,
    pub kind: PropertyKind,
    pub length: PropertyLength,
    pub count: PropertyCount,
    /// Name of the value map this property refers to, if any
    pub map_name: Option<String>,
}

#[doc(hidden)]
impl Property {
    pub fn new(name: String, property: &EventPropertyInfo, map_name: Option<String>) -> Self {
        let flags = PropertyFlags::from_bits_truncate(property.flags);

        let kind = if flags.contains(PropertyFlags::PROPERTY_STRUCT) {
            PropertyKind::Struct {
                start_index: property.in_type_or_struct_start,
                member_count: property.out_type_or_member_count,
            }
        } else {
            PropertyKind::Value {
                in_type: property.in_type_or_struct_start,
                out_type: property.out_type_or_member_count,
            }
        };

        let length = if flags.contains(PropertyFlags::PROPERTY_PARAM_LENGTH) {
            PropertyLength::Index(property.length_or_index)
        } else {
            PropertyLength::Length(property.length_or_index)
        };

        let count = if flags.contains(PropertyFlags::PROPERTY_PARAM_COUNT) {
            PropertyCount::Index(property.count_or_index)
        } else {
            PropertyCount::Count(property.count_or_index)
        };

        Property {
            name,
            flags,
            kind,
            length,
            count,
            map_name: map_name.filter(|m| !m.is_empty()),
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind, PropertyKind::Struct { .. })
    }

    /// Whether this property holds several elements
    ///
    /// A property is an array when its count is given by another property, when it is flagged as a
    /// fixed-size array, or when its static count is greater than one.
    pub fn is_array(&self) -> bool {
        self.flags
            .intersects(PropertyFlags::PROPERTY_PARAM_COUNT | PropertyFlags::PROPERTY_PARAM_FIXED_COUNT)
            || matches!(self.count, PropertyCount::Count(c) if c > 1)
    }

    /// Raw TDH in type, `0` for structures
    pub fn raw_in_type(&self) -> u16 {
        match self.kind {
            PropertyKind::Value { in_type, .. } => in_type,
            PropertyKind::Struct { .. } => 0,
        }
    }

    /// Raw TDH out type, `0` for structures
    pub fn raw_out_type(&self) -> u16 {
        match self.kind {
            PropertyKind::Value { out_type, .. } => out_type,
            PropertyKind::Struct { .. } => 0,
        }
    }

    pub fn in_type(&self) -> TdhInType {
        FromPrimitive::from_u16(self.raw_in_type()).unwrap_or(TdhInType::InTypeNull)
    }

    pub fn out_type(&self) -> TdhOutType {
        FromPrimitive::from_u16(self.raw_out_type()).unwrap_or(TdhOutType::OutTypeNull)
    }
}

/// Represent a TDH_IN_TYPE
#[repr(u16)]
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Default)]
pub enum TdhInType {
    // Deprecated values are not defined
    #[default]
    InTypeNull,
    InTypeUnicodeString,
    InTypeAnsiString,
    InTypeInt8,    // Field size is 1 byte
    InTypeUInt8,   // Field size is 1 byte
    InTypeInt16,   // Field size is 2 bytes
    InTypeUInt16,  // Field size is 2 bytes
    InTypeInt32,   // Field size is 4 bytes
    InTypeUInt32,  // Field size is 4 bytes
    InTypeInt64,   // Field size is 8 bytes
    InTypeUInt64,  // Field size is 8 bytes
    InTypeFloat,   // Field size is 4 bytes
    InTypeDouble,  // Field size is 8 bytes
    InTypeBoolean, // Field size is 4 bytes
    InTypeBinary,  // Depends on the OutType
    InTypeGuid,
    InTypePointer,
    InTypeFileTime,   // Field size is 8 bytes
    InTypeSystemTime, // Field size is 16 bytes
    InTypeSid,        // Field size determined by the first few bytes of the field
    InTypeHexInt32,
    InTypeHexInt64,
    InTypeManifestCountedString,
    InTypeManifestCountedAnsiString,
    InTypeReserved24,
    InTypeManifestCountedBinary,
    InTypeCountedString = 300,
    InTypeCountedAnsiString,
    InTypeReversedCountedString,
    InTypeReversedCountedAnsiString,
    InTypeNonNullTerminatedString,
    InTypeNonNullTerminatedAnsiString,
    InTypeUnicodeChar,
    InTypeAnsiChar,
    InTypeSizeT,
    InTypeHexDump,
    InTypeWbemSid,
}

impl TdhInType {
    /// Size of this type when it does not depend on the data or on the property length
    pub fn static_size(&self, pointer_size: u32) -> Option<u32> {
        match self {
            TdhInType::InTypeInt8 | TdhInType::InTypeUInt8 | TdhInType::InTypeAnsiChar => Some(1),
            TdhInType::InTypeInt16 | TdhInType::InTypeUInt16 | TdhInType::InTypeUnicodeChar => Some(2),
            TdhInType::InTypeInt32
            | TdhInType::InTypeUInt32
            | TdhInType::InTypeHexInt32
            | TdhInType::InTypeFloat
            | TdhInType::InTypeBoolean => Some(4),
            TdhInType::InTypeInt64
            | TdhInType::InTypeUInt64
            | TdhInType::InTypeHexInt64
            | TdhInType::InTypeDouble
            | TdhInType::InTypeFileTime => Some(8),
            TdhInType::InTypeGuid | TdhInType::InTypeSystemTime => Some(16),
            TdhInType::InTypePointer | TdhInType::InTypeSizeT => Some(pointer_size),
            _ => None,
        }
    }
}

/// Represent a TDH_OUT_TYPE
#[repr(u16)]
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Default)]
pub enum TdhOutType {
    #[default]
    OutTypeNull,
    OutTypeString,
    OutTypeDateTime,
    OutTypeInt8,    // Field size is 1 byte
    OutTypeUInt8,   // Field size is 1 byte
    OutTypeInt16,   // Field size is 2 bytes
    OutTypeUInt16,  // Field size is 2 bytes
    OutTypeInt32,   // Field size is 4 bytes
    OutTypeUInt32,  // Field size is 4 bytes
    OutTypeInt64,   // Field size is 8 bytes
    OutTypeUInt64,  // Field size is 8 bytes
    OutTypeFloat,   // Field size is 4 bytes
    OutTypeDouble,  // Field size is 8 bytes
    OutTypeBoolean, // Field size is 4 bytes
    OutTypeGuid,
    OutTypeHexBinary,
    OutTypeHexInt8,
    OutTypeHexInt16,
    OutTypeHexInt32,
    OutTypeHexInt64,
    OutTypePid,
    OutTypeTid,
    OutTypePort,
    OutTypeIpv4,
    OutTypeIpv6,
    OutTypeSocketAddress,
    OutTypeCimDateTime,
    OutTypeEtwTime,
    OutTypeXml,
    OutTypeErrorCode,
    OutTypeWin32Error,
    OutTypeNtStatus,
    OutTypeHResult,
    OutTypeCultureInsensitiveDateTime,
    OutTypeJson,
    OutTypeUtf8,
    OutTypePkcs7,
    OutTypeCodePointer,
    OutTypeDatetimeUtc,
    OutTypeReducedString = 300,
    OutTypeNoPrint,
}

bitflags! {
    /// Represents the Property flags
    ///
    /// See: [Property Flags enum](https://docs.microsoft.com/en-us/windows/win32/api/tdh/ne-tdh-property_flags)
    #[derive(Default)]
    pub struct PropertyFlags: u32 {
        const PROPERTY_STRUCT = 0x1;
        const PROPERTY_PARAM_LENGTH = 0x2;
        const PROPERTY_PARAM_COUNT = 0x4;
        const PROPERTY_WBEMXML_FRAGMENT = 0x8;
        const PROPERTY_PARAM_FIXED_LENGTH = 0x10;
        const PROPERTY_PARAM_FIXED_COUNT = 0x20;
        const PROPERTY_HAS_TAGS = 0x40;
        const PROPERTY_HAS_CUSTOM_SCHEMA = 0x80;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_info_layout() {
        assert_eq!(std::mem::size_of::<TraceEventInfoHeader>(), 112);
        assert_eq!(offset_of!(TraceEventInfoHeader, decoding_source), 48);
        assert_eq!(offset_of!(TraceEventInfoHeader, provider_name_offset), 52);
        assert_eq!(offset_of!(TraceEventInfoHeader, property_count), 100);
        assert_eq!(offset_of!(TraceEventInfoHeader, flags), 108);
        assert_eq!(std::mem::size_of::<EventMapInfoHeader>(), 16);
        assert_eq!(std::mem::size_of::<EventMapEntry>(), 8);
    }

    #[test]
    fn test_property_info_layout() {
        assert_eq!(std::mem::size_of::<EventPropertyInfo>(), 24);
        assert_eq!(offset_of!(EventPropertyInfo, map_name_offset), 12);
        assert_eq!(offset_of!(EventPropertyInfo, count_or_index), 16);
        assert_eq!(offset_of!(EventPropertyInfo, length_or_index), 18);
        assert_eq!(offset_of!(EventPropertyInfo, tags), 20);
    }

    #[test]
    fn test_parse_descriptor() {
        let raw = EventPropertyInfo {
            flags: (PropertyFlags::PROPERTY_PARAM_LENGTH | PropertyFlags::PROPERTY_PARAM_COUNT).bits(),
            in_type_or_struct_start: TdhInType::InTypeBinary as u16,
            out_type_or_member_count: TdhOutType::OutTypeHexBinary as u16,
            count_or_index: 3,
            length_or_index: 2,
            ..Default::default()
        };
        let prop = Property::new(String::from("Data"), &raw, Some(String::new()));
        assert_eq!(prop.length, PropertyLength::Index(2));
        assert_eq!(prop.count, PropertyCount::Index(3));
        assert_eq!(prop.in_type(), TdhInType::InTypeBinary);
        assert_eq!(prop.out_type(), TdhOutType::OutTypeHexBinary);
        assert_eq!(prop.map_name, None);
        assert!(prop.is_array());
        assert!(!prop.is_struct());

        let raw = EventPropertyInfo {
            flags: PropertyFlags::PROPERTY_STRUCT.bits(),
            in_type_or_struct_start: 4,
            out_type_or_member_count: 2,
            count_or_index: 1,
            ..Default::default()
        };
        let prop = Property::new(String::from("Entry"), &raw, None);
        assert_eq!(prop.kind, PropertyKind::Struct { start_index: 4, member_count: 2 });
        assert_eq!(prop.raw_in_type(), 0);
        assert!(!prop.is_array());
    }

    #[test]
    fn test_unknown_type_codes() {
        let raw = EventPropertyInfo {
            in_type_or_struct_start: 999,
            out_type_or_member_count: 999,
            ..Default::default()
        };
        let prop = Property::new(String::from("X"), &raw, None);
        assert_eq!(prop.in_type(), TdhInType::InTypeNull);
        assert_eq!(prop.raw_in_type(), 999);
    }
}
