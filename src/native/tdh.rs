//! Native API - Event Tracing tdh header
//!
//! The `tdh` module is an abstraction layer for the Windows tdh library. Every operation the decoder
//! needs from TDH goes through the [`TdhBackend`] trait, so that the decoding engine can be driven
//! either by the real library ([`WindowsTdh`], Windows only) or by the in-memory implementation of
//! [`crate::native::memory`].
//!
//! This module shouldn't be accessed directly. Modules from the the crate level provide a safe API to interact
//! with the crate
use super::etw_types::EventRecord;

/// `ERROR_INSUFFICIENT_BUFFER`
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
/// `ERROR_NOT_FOUND`
pub const ERROR_NOT_FOUND: u32 = 1168;
/// `ERROR_EVT_INVALID_EVENT_DATA`
pub const ERROR_EVT_INVALID_EVENT_DATA: u32 = 15005;
/// `ERROR_INVALID_PARAMETER`
pub const ERROR_INVALID_PARAMETER: u32 = 87;

/// Array index used to address a whole property (or a non-array property)
pub const WHOLE_PROPERTY: u32 = u32::MAX;

/// Tdh native module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TdhNativeError {
    /// The provided buffer is too small. `required` is expressed in the unit of the buffer
    InsufficientBuffer { required: u32 },
    /// The data does not match what the metadata (or the value map) describes
    InvalidEventData,
    /// The requested item (usually a value map) does not exist
    NotFound,
    /// Any other status returned by TDH
    Os(u32),
}

impl TdhNativeError {
    /// Convert a TDH status into a result
    pub fn check(status: u32, required: u32) -> TdhNativeResult<()> {
        match status {
            0 => Ok(()),
            ERROR_INSUFFICIENT_BUFFER => Err(TdhNativeError::InsufficientBuffer { required }),
            ERROR_EVT_INVALID_EVENT_DATA => Err(TdhNativeError::InvalidEventData),
            ERROR_NOT_FOUND => Err(TdhNativeError::NotFound),
            other => Err(TdhNativeError::Os(other)),
        }
    }
}

impl std::fmt::Display for TdhNativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientBuffer { required } => {
                write!(f, "insufficient buffer ({} required)", required)
            }
            Self::InvalidEventData => write!(f, "invalid event data"),
            Self::NotFound => write!(f, "not found"),
            Self::Os(status) => write!(f, "TDH error {}", status),
        }
    }
}

impl std::error::Error for TdhNativeError {}

pub type TdhNativeResult<T> = Result<T, TdhNativeError>;

/// One step of a property path, as in [PROPERTY_DATA_DESCRIPTOR](https://learn.microsoft.com/en-us/windows/win32/api/tdh/ns-tdh-property_data_descriptor)
///
/// A member of a structure is addressed by the path `[struct, member]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDataDescriptor<'a> {
    pub name: &'a str,
    /// Index in the array, or [`WHOLE_PROPERTY`]
    pub array_index: u32,
}

impl<'a> PropertyDataDescriptor<'a> {
    pub fn new(name: &'a str, array_index: u32) -> Self {
        Self { name, array_index }
    }

    pub fn whole(name: &'a str) -> Self {
        Self::new(name, WHOLE_PROPERTY)
    }
}

/// Arguments of `TdhFormatProperty`
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest<'a> {
    /// Raw `TRACE_EVENT_INFO` bytes of the event
    pub event_info: &'a [u8],
    /// Raw `EVENT_MAP_INFO` bytes, when the property uses a value map
    pub map_info: Option<&'a [u8]>,
    pub pointer_size: u32,
    pub in_type: u16,
    pub out_type: u16,
    pub length: u16,
    /// User data starting at the property, up to the end of the record payload
    pub user_data: &'a [u8],
}

/// Result of a successful `TdhFormatProperty` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOutcome {
    /// Number of bytes of user data consumed by the formatting
    pub consumed: u16,
}

/// The TDH operations needed to decode a record
///
/// Buffer-sized operations follow the TDH convention: when the given buffer is too small they fail
/// with [`TdhNativeError::InsufficientBuffer`], reporting the required size. Sizes are in bytes,
/// except for [`TdhBackend::format_property`] which counts UTF-16 units.
pub trait TdhBackend: Send + Sync {
    /// `TdhGetEventInformation`. Returns the number of bytes written
    fn event_information(&self, record: &EventRecord, buffer: &mut [u8]) -> TdhNativeResult<u32>;

    /// `TdhGetEventMapInformation`. Returns the number of bytes written
    fn map_information(
        &self,
        record: &EventRecord,
        map_name: &str,
        buffer: &mut [u8],
    ) -> TdhNativeResult<u32>;

    /// `TdhFormatProperty`. On success, `buffer` holds a NUL-terminated UTF-16 string
    fn format_property(
        &self,
        request: &FormatRequest<'_>,
        buffer: &mut [u16],
    ) -> TdhNativeResult<FormatOutcome>;

    /// `TdhGetPropertySize`
    fn property_size(
        &self,
        record: &EventRecord,
        path: &[PropertyDataDescriptor<'_>],
    ) -> TdhNativeResult<u32>;

    /// `TdhGetProperty`. `buffer` must be exactly as large as the property
    fn property(
        &self,
        record: &EventRecord,
        path: &[PropertyDataDescriptor<'_>],
        buffer: &mut [u8],
    ) -> TdhNativeResult<()>;
}

#[cfg(windows)]
pub use self::windows_tdh::WindowsTdh;

#[cfg(windows)]
mod windows_tdh {
    use super::*;
    use crate::traits::EncodeUtf16;
    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::System::Diagnostics::Etw;

    /// The actual `tdh.dll`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WindowsTdh;

    fn raw_record(record: &EventRecord) -> *const Etw::EVENT_RECORD {
        record.as_raw_ptr() as *const Etw::EVENT_RECORD
    }

    fn descriptors(
        path: &[PropertyDataDescriptor<'_>],
    ) -> (Vec<Vec<u16>>, Vec<Etw::PROPERTY_DATA_DESCRIPTOR>) {
        let names: Vec<Vec<u16>> = path.iter().map(|p| p.name.into_utf16()).collect();
        let descs = path
            .iter()
            .zip(names.iter())
            .map(|(p, name)| Etw::PROPERTY_DATA_DESCRIPTOR {
                PropertyName: name.as_ptr() as u64,
                ArrayIndex: p.array_index,
                ..Default::default()
            })
            .collect();
        (names, descs)
    }

    impl TdhBackend for WindowsTdh {
        fn event_information(
            &self,
            record: &EventRecord,
            buffer: &mut [u8],
        ) -> TdhNativeResult<u32> {
            let mut buffer_size = buffer.len() as u32;
            let out = if buffer.is_empty() {
                None
            } else {
                Some(buffer.as_mut_ptr() as *mut Etw::TRACE_EVENT_INFO)
            };
            let status = unsafe {
                Etw::TdhGetEventInformation(raw_record(record), None, out, &mut buffer_size)
            };
            TdhNativeError::check(status, buffer_size).map(|_| buffer_size)
        }

        fn map_information(
            &self,
            record: &EventRecord,
            map_name: &str,
            buffer: &mut [u8],
        ) -> TdhNativeResult<u32> {
            let map_name = map_name.into_utf16();
            let mut buffer_size = buffer.len() as u32;
            let out = if buffer.is_empty() {
                None
            } else {
                Some(buffer.as_mut_ptr() as *mut Etw::EVENT_MAP_INFO)
            };
            let status = unsafe {
                Etw::TdhGetEventMapInformation(
                    raw_record(record),
                    PCWSTR(map_name.as_ptr()),
                    out,
                    &mut buffer_size,
                )
            };
            TdhNativeError::check(status, buffer_size).map(|_| buffer_size)
        }

        fn format_property(
            &self,
            request: &FormatRequest<'_>,
            buffer: &mut [u16],
        ) -> TdhNativeResult<FormatOutcome> {
            // TdhFormatProperty counts its output buffer in bytes
            let mut buffer_size = (buffer.len() * 2) as u32;
            let mut consumed = 0u16;
            let status = unsafe {
                Etw::TdhFormatProperty(
                    request.event_info.as_ptr() as *const Etw::TRACE_EVENT_INFO,
                    request
                        .map_info
                        .map(|m| m.as_ptr() as *const Etw::EVENT_MAP_INFO),
                    request.pointer_size,
                    request.in_type,
                    request.out_type,
                    request.length,
                    request.user_data,
                    &mut buffer_size,
                    PWSTR(buffer.as_mut_ptr()),
                    &mut consumed,
                )
            };
            TdhNativeError::check(status, (buffer_size + 1) / 2).map(|_| FormatOutcome { consumed })
        }

        fn property_size(
            &self,
            record: &EventRecord,
            path: &[PropertyDataDescriptor<'_>],
        ) -> TdhNativeResult<u32> {
            let (_names, descs) = descriptors(path);
            let mut property_size = 0;
            let status = unsafe {
                Etw::TdhGetPropertySize(raw_record(record), None, &descs, &mut property_size)
            };
            TdhNativeError::check(status, 0).map(|_| property_size)
        }

        fn property(
            &self,
            record: &EventRecord,
            path: &[PropertyDataDescriptor<'_>],
            buffer: &mut [u8],
        ) -> TdhNativeResult<()> {
            let (_names, descs) = descriptors(path);
            let status =
                unsafe { Etw::TdhGetProperty(raw_record(record), None, &descs, buffer) };
            TdhNativeError::check(status, buffer.len() as u32)
        }
    }
}
