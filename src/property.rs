//! ETW Event Property information
//!
//! The `property` module exposes [`DecodedProperty`], a property located in the user data of an
//! event by the [`PropertyWalker`](crate::parser::PropertyWalker), and formats its value through TDH.
use once_cell::unsync::OnceCell;

use crate::native::etw_types::EventRecord;
use crate::native::tdh::{FormatRequest, TdhBackend, TdhNativeError};
use crate::schema::Schema;

/// Minimum size of the formatting buffer, in UTF-16 units
const MIN_FORMAT_BUFFER: usize = 16;
/// A backend asking for more than that is not going to succeed
const MAX_FORMAT_BUFFER: usize = 1 << 20;

/// Property module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    /// TDH could not format the value of this property
    FormatFailed {
        property: String,
        source: TdhNativeError,
    },
}

impl std::fmt::Display for PropertyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FormatFailed { property, source } => {
                write!(f, "failed to format property {}: {}", property, source)
            }
        }
    }
}

impl std::error::Error for PropertyError {}

pub type PropertyResult<T> = Result<T, PropertyError>;

/// What formatting a value needs besides the property itself
#[derive(Clone, Copy)]
pub struct FormatContext<'a> {
    pub backend: &'a dyn TdhBackend,
    pub record: &'a EventRecord,
    pub schema: &'a Schema,
}

/// A property located in the user data of a record
///
/// Its value is formatted on first access only, and then kept (including an empty value, or
/// the error that prevented formatting it).
#[derive(Debug, Clone)]
pub struct DecodedProperty {
    name: String,
    /// Length hint given to TDH when formatting
    length: u32,
    /// Offset of the value in the user data
    offset: usize,
    /// Bytes the value occupies in the user data
    size: usize,
    /// User data bytes left from `offset`
    remaining: usize,
    in_type: u16,
    out_type: u16,
    map_name: Option<String>,
    parseable: bool,
    value: OnceCell<PropertyResult<String>>,
}

impl DecodedProperty {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        length: u32,
        offset: usize,
        size: usize,
        remaining: usize,
        in_type: u16,
        out_type: u16,
        map_name: Option<String>,
    ) -> Self {
        Self {
            name,
            length,
            offset,
            size,
            remaining,
            in_type,
            out_type,
            map_name,
            parseable: true,
            value: OnceCell::new(),
        }
    }

    /// A property that is not backed by user data, with a known value
    pub fn with_value(name: &str, value: &str) -> Self {
        Self {
            name: name.to_owned(),
            length: 0,
            offset: 0,
            size: 0,
            remaining: 0,
            in_type: 0,
            out_type: 0,
            map_name: None,
            parseable: false,
            value: OnceCell::from(Ok(value.to_owned())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn in_type(&self) -> u16 {
        self.in_type
    }

    pub fn out_type(&self) -> u16 {
        self.out_type
    }

    pub fn map_name(&self) -> Option<&str> {
        self.map_name.as_deref()
    }

    /// Whether this property points to user data
    pub fn is_parseable(&self) -> bool {
        self.parseable
    }

    /// Whether the value has been computed already
    pub fn is_formatted(&self) -> bool {
        self.value.get().is_some()
    }

    /// The raw bytes of this property
    pub fn raw<'r>(&self, record: &'r EventRecord) -> &'r [u8] {
        record
            .user_buffer()
            .get(self.offset..self.offset + self.size)
            .unwrap_or(&[])
    }

    pub(crate) fn set_value(&mut self, value: &str) {
        self.value = OnceCell::from(Ok(value.to_owned()));
    }

    /// The formatted value, computed at most once
    pub fn value(&self, ctx: &FormatContext<'_>) -> PropertyResult<&str> {
        match self.value.get_or_init(|| self.format(ctx)) {
            Ok(s) => Ok(s.as_str()),
            Err(e) => Err(e.clone()),
        }
    }

    fn failed(&self, source: TdhNativeError) -> PropertyError {
        PropertyError::FormatFailed {
            property: self.name.clone(),
            source,
        }
    }

    /// `TdhGetEventMapInformation`, where an unknown map simply means "no map"
    fn map_info(&self, ctx: &FormatContext<'_>, map_name: &str) -> PropertyResult<Option<Vec<u8>>> {
        let required = match ctx.backend.map_information(ctx.record, map_name, &mut []) {
            Err(TdhNativeError::InsufficientBuffer { required }) => required,
            Ok(_) | Err(TdhNativeError::NotFound) => return Ok(None),
            Err(e) => return Err(self.failed(e)),
        };

        let mut buffer = vec![0u8; required as usize];
        match ctx.backend.map_information(ctx.record, map_name, &mut buffer) {
            Ok(written) => {
                buffer.truncate(written as usize);
                Ok(Some(buffer))
            }
            Err(TdhNativeError::NotFound) => Ok(None),
            Err(e) => Err(self.failed(e)),
        }
    }

    fn format(&self, ctx: &FormatContext<'_>) -> PropertyResult<String> {
        let map = match &self.map_name {
            Some(map_name) => self.map_info(ctx, map_name)?,
            None => None,
        };
        let mut map_info = map.as_deref();

        let user_data = ctx
            .record
            .user_buffer()
            .get(self.offset..self.offset + self.remaining)
            .unwrap_or(&[]);

        let mut buffer = vec![0u16; MIN_FORMAT_BUFFER.max(self.length as usize)];
        loop {
            let request = FormatRequest {
                event_info: ctx.schema.info().as_bytes(),
                map_info,
                pointer_size: ctx.record.pointer_size(),
                in_type: self.in_type,
                out_type: self.out_type,
                length: self.length as u16,
                user_data,
            };

            match ctx.backend.format_property(&request, &mut buffer) {
                Ok(_) => {
                    let end = buffer.iter().position(|u| *u == 0).unwrap_or(buffer.len());
                    return Ok(widestring::decode_utf16_lossy(buffer[..end].iter().copied()).collect());
                }
                Err(TdhNativeError::InsufficientBuffer { required }) => {
                    if buffer.len() >= MAX_FORMAT_BUFFER {
                        return Err(self.failed(TdhNativeError::InsufficientBuffer { required }));
                    }
                    let size = if required as usize > buffer.len() {
                        required as usize
                    } else {
                        buffer.len() * 2
                    };
                    buffer = vec![0u16; size.min(MAX_FORMAT_BUFFER)];
                }
                // Some maps do not cover every value, TDH can still format it unmapped
                Err(TdhNativeError::InvalidEventData) if map_info.is_some() => map_info = None,
                Err(TdhNativeError::InvalidEventData) => return Ok(String::new()),
                Err(e) => return Err(self.failed(e)),
            }
        }
    }
}

impl PartialEq for DecodedProperty {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.offset == other.offset && self.size == other.size
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::{EventDescriptor, EventHeader, Guid, OwnedEventRecord};
    use crate::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder, ValueMap};
    use crate::native::tdh::{FormatOutcome, PropertyDataDescriptor, TdhNativeResult};
    use crate::native::tdh_types::{TdhInType, TdhOutType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROVIDER: Guid = Guid::from_values(0x2222, 0, 0, [1; 8]);

    /// Forwards to a [`MemoryTdh`], counting formatting calls and forcing their first outcome
    struct Scripted {
        inner: MemoryTdh,
        calls: AtomicUsize,
        first: Option<TdhNativeError>,
    }

    impl TdhBackend for Scripted {
        fn event_information(&self, record: &EventRecord, buffer: &mut [u8]) -> TdhNativeResult<u32> {
            self.inner.event_information(record, buffer)
        }

        fn map_information(
            &self,
            record: &EventRecord,
            map_name: &str,
            buffer: &mut [u8],
        ) -> TdhNativeResult<u32> {
            self.inner.map_information(record, map_name, buffer)
        }

        fn format_property(
            &self,
            request: &FormatRequest<'_>,
            buffer: &mut [u16],
        ) -> TdhNativeResult<FormatOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match (&self.first, call) {
                (Some(e), 0) => Err(e.clone()),
                _ => self.inner.format_property(request, buffer),
            }
        }

        fn property_size(
            &self,
            record: &EventRecord,
            path: &[PropertyDataDescriptor<'_>],
        ) -> TdhNativeResult<u32> {
            self.inner.property_size(record, path)
        }

        fn property(
            &self,
            record: &EventRecord,
            path: &[PropertyDataDescriptor<'_>],
            buffer: &mut [u8],
        ) -> TdhNativeResult<()> {
            self.inner.property(record, path, buffer)
        }
    }

    fn setup(first: Option<TdhNativeError>) -> (Scripted, OwnedEventRecord) {
        let inner = MemoryTdh::new()
            .with_schema(
                SchemaBuilder::new(PROVIDER, EventDescriptor::default()).property(
                    PropertyDef::value("State", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull)
                        .with_map("States"),
                ),
            )
            .with_map(PROVIDER, ValueMap::value_map("States").entry(1, "Running"));

        let mut header = EventHeader::default();
        header.provider_id = PROVIDER;
        let record = OwnedEventRecord::new(header, 3u32.to_le_bytes().to_vec());
        (
            Scripted {
                inner,
                calls: AtomicUsize::new(0),
                first,
            },
            record,
        )
    }

    fn state(map_name: Option<&str>) -> DecodedProperty {
        DecodedProperty::new(
            "State".to_owned(),
            4,
            0,
            4,
            4,
            TdhInType::InTypeUInt32 as u16,
            TdhOutType::OutTypeNull as u16,
            map_name.map(str::to_owned),
        )
    }

    #[test]
    fn test_value_is_computed_once() {
        let (tdh, record) = setup(None);
        let schema = Schema::from_record(&tdh, &record).unwrap();
        let ctx = FormatContext {
            backend: &tdh,
            record: &record,
            schema: &schema,
        };

        let property = state(None);
        assert!(!property.is_formatted());
        assert_eq!(property.value(&ctx), Ok("3"));
        assert_eq!(property.value(&ctx), Ok("3"));
        assert!(property.is_formatted());
        assert_eq!(tdh.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unmapped_value_is_retried_without_map() {
        let (tdh, record) = setup(None);
        let schema = Schema::from_record(&tdh, &record).unwrap();
        let ctx = FormatContext {
            backend: &tdh,
            record: &record,
            schema: &schema,
        };

        // 3 is not part of the map
        assert_eq!(state(Some("States")).value(&ctx), Ok("3"));
        assert_eq!(tdh.calls.load(Ordering::SeqCst), 2);

        // and an unknown map is no map at all
        assert_eq!(state(Some("Unknown")).value(&ctx), Ok("3"));
    }

    #[test]
    fn test_invalid_data_without_map() {
        let (tdh, record) = setup(Some(TdhNativeError::InvalidEventData));
        let schema = Schema::from_record(&tdh, &record).unwrap();
        let ctx = FormatContext {
            backend: &tdh,
            record: &record,
            schema: &schema,
        };

        let property = state(None);
        assert_eq!(property.value(&ctx), Ok(""));
        assert_eq!(property.value(&ctx), Ok(""));
        assert_eq!(tdh.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffer_grows() {
        let (tdh, record) = setup(Some(TdhNativeError::InsufficientBuffer { required: 4 }));
        let schema = Schema::from_record(&tdh, &record).unwrap();
        let ctx = FormatContext {
            backend: &tdh,
            record: &record,
            schema: &schema,
        };

        assert_eq!(state(None).value(&ctx), Ok("3"));
        assert_eq!(tdh.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_format_failure_is_kept() {
        let (tdh, record) = setup(Some(TdhNativeError::Os(5)));
        let schema = Schema::from_record(&tdh, &record).unwrap();
        let ctx = FormatContext {
            backend: &tdh,
            record: &record,
            schema: &schema,
        };

        let property = state(None);
        let expected = Err(PropertyError::FormatFailed {
            property: "State".to_owned(),
            source: TdhNativeError::Os(5),
        });
        assert_eq!(property.value(&ctx), expected);
        assert_eq!(property.value(&ctx), expected);
        assert_eq!(tdh.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_known_value() {
        let property = DecodedProperty::with_value("Computed", "");
        assert!(!property.is_parseable());
        assert!(property.is_formatted());
    }
}
