//! Basic ETW types
//!
//! The `etw_types` module provides the basic ETW types needed to decode an event record.
//! Every `#[repr(C)]` type in this module is laid out exactly like its Windows counterpart, so that
//! a record handed over by the OS can be viewed through these types without any copy.
//!
//! In most cases a user of the crate won't have to deal with this and can directly obtain the data
//! needed by using the functions exposed by the modules at the crate level
use std::fmt::Formatter;
use std::str::FromStr;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub mod event_record;
pub use event_record::{EtwBufferContext, EventHeader, EventRecord, OwnedEventRecord, PayloadTooLarge};

pub mod extended_data;
pub use extended_data::{EventHeaderExtendedDataItem, ExtendedDataItem};

/// Handle returned by `OpenTrace`, as used by `ProcessTrace` and `CloseTrace`
pub type TraceHandle = u64;

/// `INVALID_PROCESSTRACE_HANDLE`
pub const INVALID_TRACE_HANDLE: TraceHandle = u64::MAX;

/// The event header contains a 32-bit pointer size
pub const EVENT_HEADER_FLAG_32_BIT_HEADER: u16 = 0x0020;
/// The event header contains a 64-bit pointer size
pub const EVENT_HEADER_FLAG_64_BIT_HEADER: u16 = 0x0040;

/// Extended data item type carrying the related activity id
pub const EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID: u16 = 0x0001;
/// Extended data item type carrying the terminal session id
pub const EVENT_HEADER_EXT_TYPE_TS_ID: u16 = 0x0003;
/// Extended data item type carrying the unique event key
pub const EVENT_HEADER_EXT_TYPE_EVENT_KEY: u16 = 0x000A;
/// Extended data item type carrying the process start key
pub const EVENT_HEADER_EXT_TYPE_PROCESS_START_KEY: u16 = 0x000D;

/// A [GUID](https://learn.microsoft.com/en-us/windows/win32/api/guiddef/ns-guiddef-guid), laid out like the Windows one
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, FromZeroes, FromBytes, AsBytes)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// GUID parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidParseError(String);

impl std::fmt::Display for GuidParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid GUID {:?}", self.0)
    }
}

impl std::error::Error for GuidParseError {}

impl Guid {
    pub const fn zeroed() -> Self {
        Self::from_values(0, 0, 0, [0; 8])
    }

    pub const fn from_values(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zeroed()
    }
}

impl FromStr for Guid {
    type Err = GuidParseError;

    /// Parses `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`, with or without surrounding braces
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || GuidParseError(s.to_owned());

        let trimmed = s.trim_start_matches('{').trim_end_matches('}');
        let groups: Vec<&str> = trimmed.split('-').collect();
        let expected_lengths = [8, 4, 4, 4, 12];
        if groups.len() != expected_lengths.len()
            || groups
                .iter()
                .zip(expected_lengths.iter())
                .any(|(g, l)| g.len() != *l || !g.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(err());
        }

        let data1 = u32::from_str_radix(groups[0], 16).map_err(|_| err())?;
        let data2 = u16::from_str_radix(groups[1], 16).map_err(|_| err())?;
        let data3 = u16::from_str_radix(groups[2], 16).map_err(|_| err())?;
        let tail = format!("{}{}", groups[3], groups[4]);
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| err())?;
        }

        Ok(Self::from_values(data1, data2, data3, data4))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

#[cfg(windows)]
impl From<windows::core::GUID> for Guid {
    fn from(g: windows::core::GUID) -> Self {
        Self::from_values(g.data1, g.data2, g.data3, g.data4)
    }
}

/// Mirror of [EVENT_DESCRIPTOR](https://learn.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_descriptor)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromZeroes, FromBytes, AsBytes)]
pub struct EventDescriptor {
    pub id: u16,
    pub version: u8,
    pub channel: u8,
    pub level: u8,
    pub opcode: u8,
    pub task: u16,
    pub keyword: u64,
}

/// Wrapper over the [DECODING_SOURCE] type
///
/// [DECODING_SOURCE]: https://learn.microsoft.com/en-us/windows/win32/api/tdh/ne-tdh-decoding_source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingSource {
    DecodingSourceXMLFile,
    DecodingSourceWbem,
    DecodingSourceWPP,
    DecodingSourceTlg,
    DecodingSourceMax,
}

impl From<i32> for DecodingSource {
    fn from(val: i32) -> Self {
        match val {
            0 => DecodingSource::DecodingSourceXMLFile,
            1 => DecodingSource::DecodingSourceWbem,
            2 => DecodingSource::DecodingSourceWPP,
            3 => DecodingSource::DecodingSourceTlg,
            _ => DecodingSource::DecodingSourceMax,
        }
    }
}

impl From<DecodingSource> for i32 {
    fn from(val: DecodingSource) -> Self {
        match val {
            DecodingSource::DecodingSourceXMLFile => 0,
            DecodingSource::DecodingSourceWbem => 1,
            DecodingSource::DecodingSourceWPP => 2,
            DecodingSource::DecodingSourceTlg => 3,
            DecodingSource::DecodingSourceMax => 4,
        }
    }
}

bitflags! {
    /// Represents the [TEMPLATE_FLAGS](https://learn.microsoft.com/en-us/windows/win32/api/tdh/ne-tdh-template_flags)
    #[derive(Default)]
    pub struct TemplateFlags: u32 {
        const TEMPLATE_EVENT_DATA = 0x1;
        const TEMPLATE_USER_DATA = 0x2;
        const TEMPLATE_CONTROL_GUID = 0x4;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_guid_roundtrip_display() {
        let guid: Guid = "{6A399AE0-4BC6-4DE9-870B-3657F8947E7E}".parse().unwrap();
        assert_eq!(guid.data1, 0x6a399ae0);
        assert_eq!(guid.data2, 0x4bc6);
        assert_eq!(guid.data3, 0x4de9);
        assert_eq!(guid.data4, [0x87, 0x0b, 0x36, 0x57, 0xf8, 0x94, 0x7e, 0x7e]);
        assert_eq!(guid.to_string(), "{6A399AE0-4BC6-4DE9-870B-3657F8947E7E}");

        let lower: Guid = "6a399ae0-4bc6-4de9-870b-3657f8947e7e".parse().unwrap();
        assert_eq!(lower, guid);
    }

    #[test]
    fn test_guid_rejects_garbage() {
        assert!("not-a-guid".parse::<Guid>().is_err());
        assert!("{6A399AE0-4BC6-4DE9-870B-3657F8947E7}".parse::<Guid>().is_err());
        assert!("6A399AE0-4BC6-4DE9-870B-3657F8947E7G".parse::<Guid>().is_err());
    }

    #[test]
    fn test_layouts() {
        assert_eq!(std::mem::size_of::<Guid>(), 16);
        assert_eq!(std::mem::size_of::<EventDescriptor>(), 16);
        assert_eq!(offset_of!(EventDescriptor, task), 6);
        assert_eq!(offset_of!(EventDescriptor, keyword), 8);
    }
}
