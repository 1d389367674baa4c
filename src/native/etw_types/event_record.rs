//! Safe wrappers over the EVENT_RECORD type
use std::convert::TryFrom;

use crate::native::etw_types::extended_data::{EventHeaderExtendedDataItem, ExtendedDataItem};
use crate::native::etw_types::{
    EventDescriptor, Guid, EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID,
    EVENT_HEADER_FLAG_32_BIT_HEADER,
};

/// Mirror of [EVENT_HEADER](https://learn.microsoft.com/en-us/windows/win32/api/evntcons/ns-evntcons-event_header)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EventHeader {
    pub size: u16,
    pub header_type: u16,
    pub flags: u16,
    pub event_property: u16,
    pub thread_id: u32,
    pub process_id: u32,
    pub timestamp: i64,
    pub provider_id: Guid,
    pub event_descriptor: EventDescriptor,
    /// Union of `KernelTime`/`UserTime` (two `u32`) and `ProcessorTime`
    pub processor_time: u64,
    pub activity_id: Guid,
}

/// Mirror of [ETW_BUFFER_CONTEXT](https://learn.microsoft.com/en-us/windows/win32/api/evntcons/ns-evntcons-etw_buffer_context)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EtwBufferContext {
    pub processor_number: u8,
    pub alignment: u8,
    pub logger_id: u16,
}

/// A read-only view over an [EVENT_RECORD](https://docs.microsoft.com/en-us/windows/win32/api/evntcons/ns-evntcons-event_record)
///
/// This is laid out exactly like the Windows structure, so that a pointer handed to an event callback
/// can be reinterpreted as a `&EventRecord`.
#[repr(C)]
pub struct EventRecord {
    header: EventHeader,
    buffer_context: EtwBufferContext,
    extended_data_count: u16,
    user_data_length: u16,
    extended_data: *const EventHeaderExtendedDataItem,
    user_data: *const u8,
    #[allow(dead_code)]
    user_context: *mut std::ffi::c_void,
}

impl EventRecord {
    /// Create a `&self` from a Windows pointer.
    ///
    /// # Safety
    ///
    /// 1. Once an instance of `Self` is created, one should make sure the pointed data does not get modified (or dealloc'ed).
    /// 2. The returned lifetime is arbitray. To restrict the use of the returned reference (and to ensure the first safety guarantee), simply pass it to a sub-function whose signature has no explicit lifetime.
    ///    Thus, the sub-function will not be able to leak this reference.
    pub unsafe fn from_ptr<'a, T>(p: *const T) -> Option<&'a Self> {
        let s = p as *const Self;
        s.as_ref()
    }

    /// Get a pointer to this record (usually to feed Windows API functions)
    ///
    /// The returned pointer is only valid as long `self` is valid and not modified.
    pub fn as_raw_ptr(&self) -> *const std::ffi::c_void {
        self as *const Self as *const std::ffi::c_void
    }

    /// The whole `EventHeader` of this record
    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    /// The `BufferContext` of this record
    pub fn buffer_context(&self) -> &EtwBufferContext {
        &self.buffer_context
    }

    /// The `ProviderId` field from the wrapped `EVENT_RECORD`
    pub fn provider_id(&self) -> Guid {
        self.header.provider_id
    }

    /// The `EventDescriptor` field from the wrapped `EVENT_RECORD`
    pub fn event_descriptor(&self) -> &EventDescriptor {
        &self.header.event_descriptor
    }

    /// The `Id` field from the wrapped `EVENT_RECORD`
    pub fn event_id(&self) -> u16 {
        self.header.event_descriptor.id
    }

    /// The `Opcode` field from the wrapped `EVENT_RECORD`
    pub fn opcode(&self) -> u8 {
        self.header.event_descriptor.opcode
    }

    /// The `Version` field from the wrapped `EVENT_RECORD`
    pub fn version(&self) -> u8 {
        self.header.event_descriptor.version
    }

    /// The `Level` field from the wrapped `EVENT_RECORD`
    pub fn level(&self) -> u8 {
        self.header.event_descriptor.level
    }

    /// The `Channel` field from the wrapped `EVENT_RECORD`
    pub fn channel(&self) -> u8 {
        self.header.event_descriptor.channel
    }

    /// The `Task` field from the wrapped `EVENT_RECORD`
    pub fn task(&self) -> u16 {
        self.header.event_descriptor.task
    }

    /// The `Keyword` field from the wrapped `EVENT_RECORD`
    pub fn keyword(&self) -> u64 {
        self.header.event_descriptor.keyword
    }

    /// The `Flags` field from the wrapped `EVENT_RECORD`
    pub fn event_flags(&self) -> u16 {
        self.header.flags
    }

    /// The `ProcessId` field from the wrapped `EVENT_RECORD`
    pub fn process_id(&self) -> u32 {
        self.header.process_id
    }

    /// The `ThreadId` field from the wrapped `EVENT_RECORD`
    pub fn thread_id(&self) -> u32 {
        self.header.thread_id
    }

    /// The `ActivityId` field from the wrapped `EVENT_RECORD`
    pub fn activity_id(&self) -> Guid {
        self.header.activity_id
    }

    /// The `TimeStamp` field from the wrapped `EVENT_RECORD`
    ///
    /// As per [Microsoft's documentation](https://docs.microsoft.com/en-us/windows/win32/api/evntcons/ns-evntcons-event_header):
    /// > Contains the time that the event occurred.<br/>
    /// > The resolution is system time unless the `ProcessTraceMode member` of `EVENT_TRACE_LOGFILE`
    /// > contains the `PROCESS_TRACE_MODE_RAW_TIMESTAMP` flag, in which case the resolution depends
    /// > on the value of the `Wnode.ClientContext` member of `EVENT_TRACE_PROPERTIES` at the time
    /// > the controller created the session.
    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    /// Size of a pointer in the process that emitted this record
    ///
    /// Required by TDH to decode pointer-sized properties.
    pub fn pointer_size(&self) -> u32 {
        if self.header.flags & EVENT_HEADER_FLAG_32_BIT_HEADER != 0 {
            4
        } else {
            8
        }
    }

    /// The payload (`UserData`) of this record
    pub fn user_buffer(&self) -> &[u8] {
        if self.user_data.is_null() || self.user_data_length == 0 {
            return &[];
        }

        // Safety: the pointer and its length both come from the same record, which is not mutated during the lifetime of `self`
        unsafe { std::slice::from_raw_parts(self.user_data, self.user_data_length.into()) }
    }

    /// Returns the ExtendedData from the ETW Event
    ///
    /// # Example
    /// ```
    /// # use etwdecode::native::etw_types::{EventRecord, EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID};
    /// fn related_activity(record: &EventRecord) {
    ///     let activity_id = record
    ///         .extended_data()
    ///         .iter()
    ///         .find(|edata| edata.data_type() == EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID)
    ///         .map(|edata| edata.to_extended_data_item());
    /// }
    /// ```
    pub fn extended_data(&self) -> &[EventHeaderExtendedDataItem] {
        let n_extended_data = self.extended_data_count;
        let p_ed_array = self.extended_data;
        if n_extended_data == 0 || p_ed_array.is_null() {
            return &[];
        }

        // Safety: * we're building a slice from an array pointer size given by Windows
        //         * the pointed data is not supposed to be mutated during the lifetime of `Self`
        unsafe { std::slice::from_raw_parts(p_ed_array, n_extended_data as usize) }
    }

    /// The related activity id, when the record carries one in its extended data
    pub fn related_activity_id(&self) -> Option<Guid> {
        self.extended_data()
            .iter()
            .filter(|edata| edata.data_type() == EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID)
            .find_map(|edata| match edata.to_extended_data_item() {
                ExtendedDataItem::RelatedActivityId(guid) => Some(guid),
                _ => None,
            })
    }
}

impl std::fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecord")
            .field("header", &self.header)
            .field("extended_data_count", &self.extended_data_count)
            .field("user_data_length", &self.user_data_length)
            .finish()
    }
}

/// A payload does not fit in the 16-bit length fields of an `EVENT_RECORD`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTooLarge {
    pub size: usize,
}

impl std::fmt::Display for PayloadTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "payload of {} bytes exceeds the {} bytes an event can carry", self.size, u16::MAX)
    }
}

impl std::error::Error for PayloadTooLarge {}

fn payload_length(payload: &[u8]) -> Result<u16, PayloadTooLarge> {
    u16::try_from(payload.len()).map_err(|_| PayloadTooLarge { size: payload.len() })
}

/// An [`EventRecord`] that owns its payload and extended data
///
/// The Windows API only ever lends records for the duration of a callback. This type is what
/// replayed or synthesized records look like: it can be moved across threads and stored, and it
/// derefs to an `&EventRecord` that looks exactly like one handed over by the OS.
pub struct OwnedEventRecord {
    record: EventRecord,
    user_data: Vec<u8>,
    extended_items: Vec<EventHeaderExtendedDataItem>,
    extended_payloads: Vec<Vec<u8>>,
}

// Safety: every pointer inside `record` points into heap buffers exclusively owned by `self`
unsafe impl Send for OwnedEventRecord {}
unsafe impl Sync for OwnedEventRecord {}

impl OwnedEventRecord {
    /// # Panics
    /// If `user_data` is larger than `u16::MAX` bytes. See [`OwnedEventRecord::try_new`].
    pub fn new(header: EventHeader, user_data: Vec<u8>) -> Self {
        match Self::try_new(header, user_data) {
            Ok(record) => record,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn try_new(header: EventHeader, user_data: Vec<u8>) -> Result<Self, PayloadTooLarge> {
        payload_length(&user_data)?;
        let mut owned = Self {
            record: EventRecord {
                header,
                buffer_context: EtwBufferContext::default(),
                extended_data_count: 0,
                user_data_length: 0,
                extended_data: std::ptr::null(),
                user_data: std::ptr::null(),
                user_context: std::ptr::null_mut(),
            },
            user_data,
            extended_items: Vec::new(),
            extended_payloads: Vec::new(),
        };
        owned.sync_pointers();
        Ok(owned)
    }

    /// Attach a raw extended data item
    ///
    /// # Panics
    /// If `payload` is larger than `u16::MAX` bytes.
    pub fn with_extended_data(mut self, ext_type: u16, payload: Vec<u8>) -> Self {
        let size = match payload_length(&payload) {
            Ok(size) => size,
            Err(e) => panic!("{}", e),
        };
        let item = EventHeaderExtendedDataItem::new(ext_type, size, payload.as_ptr() as u64);
        self.extended_payloads.push(payload);
        self.extended_items.push(item);
        self.sync_pointers();
        self
    }

    /// Attach a related activity id, the way the OS does for correlated events
    pub fn with_related_activity_id(self, guid: Guid) -> Self {
        let payload = zerocopy::AsBytes::as_bytes(&guid).to_vec();
        self.with_extended_data(EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID, payload)
    }

    pub fn with_buffer_context(mut self, context: EtwBufferContext) -> Self {
        self.record.buffer_context = context;
        self
    }

    fn sync_pointers(&mut self) {
        // Checked by the constructor
        self.record.user_data_length = self.user_data.len() as u16;
        self.record.user_data = if self.user_data.is_empty() {
            std::ptr::null()
        } else {
            self.user_data.as_ptr()
        };

        // Payload vectors never reallocate once pushed, but the outer vector may have moved them around.
        for (item, payload) in self.extended_items.iter_mut().zip(self.extended_payloads.iter()) {
            item.set_data_ptr(payload.as_ptr() as u64);
        }
        self.record.extended_data_count = self.extended_items.len() as u16;
        self.record.extended_data = if self.extended_items.is_empty() {
            std::ptr::null()
        } else {
            self.extended_items.as_ptr()
        };
    }
}

impl std::ops::Deref for OwnedEventRecord {
    type Target = EventRecord;

    fn deref(&self) -> &EventRecord {
        &self.record
    }
}

impl std::fmt::Debug for OwnedEventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.record, f)
    }
}
