//! A module to handle Extended Data from ETW traces

use zerocopy::FromBytes;

use crate::native::etw_types::{
    Guid, EVENT_HEADER_EXT_TYPE_EVENT_KEY, EVENT_HEADER_EXT_TYPE_PROCESS_START_KEY,
    EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID, EVENT_HEADER_EXT_TYPE_TS_ID,
};

/// Mirror of [EVENT_HEADER_EXTENDED_DATA_ITEM](https://learn.microsoft.com/en-us/windows/win32/api/evntcons/ns-evntcons-event_header_extended_data_item)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventHeaderExtendedDataItem {
    #[allow(dead_code)]
    reserved1: u16,
    ext_type: u16,
    /// `Linkage` (1 bit) and `Reserved2` (15 bits)
    flags: u16,
    data_size: u16,
    data_ptr: u64,
}

/// A safe representation of an ExtendedDataItem
///
/// See <https://docs.microsoft.com/en-us/windows/win32/api/relogger/ns-relogger-event_header_extended_data_item>
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedDataItem {
    /// Unexpected, invalid or not implemented yet
    Unsupported,
    /// Related activity identifier
    RelatedActivityId(Guid),
    /// Terminal session identifier
    TsId(u32),
    /// Unique event identifier
    EventKey(u64),
    /// Unique process identifier (unique across the boot session)
    ProcessStartKey(u64),
}

impl EventHeaderExtendedDataItem {
    pub(crate) fn new(ext_type: u16, data_size: u16, data_ptr: u64) -> Self {
        Self {
            reserved1: 0,
            ext_type,
            flags: 0,
            data_size,
            data_ptr,
        }
    }

    pub(crate) fn set_data_ptr(&mut self, data_ptr: u64) {
        self.data_ptr = data_ptr;
    }

    /// Returns the `ExtType` of this extended data.
    ///
    /// See <https://docs.microsoft.com/en-us/windows/win32/api/relogger/ns-relogger-event_header_extended_data_item> for possible values
    pub fn data_type(&self) -> u16 {
        self.ext_type
    }

    /// Whether this item is linked to the next one (as stack traces may be)
    pub fn linkage(&self) -> bool {
        self.flags & 0x1 != 0
    }

    /// The raw bytes of this item
    pub fn data(&self) -> &[u8] {
        let data_ptr = self.data_ptr as usize as *const u8;
        if data_ptr.is_null() || self.data_size == 0 {
            return &[];
        }

        // Safety: DataPtr and DataSize describe a single buffer owned by the record this item belongs to
        unsafe { std::slice::from_raw_parts(data_ptr, self.data_size as usize) }
    }

    /// Returns this extended data as a variant of a Rust enum.
    pub fn to_extended_data_item(&self) -> ExtendedDataItem {
        let data = self.data();

        match self.ext_type {
            EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID => Guid::read_from_prefix(data)
                .map(ExtendedDataItem::RelatedActivityId)
                .unwrap_or(ExtendedDataItem::Unsupported),

            EVENT_HEADER_EXT_TYPE_TS_ID => u32::read_from_prefix(data)
                .map(ExtendedDataItem::TsId)
                .unwrap_or(ExtendedDataItem::Unsupported),

            EVENT_HEADER_EXT_TYPE_PROCESS_START_KEY => u64::read_from_prefix(data)
                .map(ExtendedDataItem::ProcessStartKey)
                .unwrap_or(ExtendedDataItem::Unsupported),

            EVENT_HEADER_EXT_TYPE_EVENT_KEY => u64::read_from_prefix(data)
                .map(ExtendedDataItem::EventKey)
                .unwrap_or(ExtendedDataItem::Unsupported),

            _ => ExtendedDataItem::Unsupported,
        }
    }
}
