//! Turns one [`EventRecord`] into an [`Event`]
//!
//! Decoding goes through the following states:
//!
//! ```text
//! Initialized -> MetadataResolved -> Skippable -> PropertiesWalked -> SkippablePostPrepare -> Built
//! ```
//!
//! [`EventHooks`] are called at both `Skippable` checkpoints, where they can give up on the event
//! (see [`EventDecoder::skip`]) before any more work is done on it, or restrict formatting to the
//! properties they are interested in (see [`EventDecoder::select_fields`]).
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;

use crate::event::{computer_name, Event, EventMetadata};
use crate::native::etw_types::{EventRecord, Guid};
use crate::native::tdh::TdhBackend;
use crate::native::time::FileTime;
use crate::parser::{ParserError, PropertyTable, PropertyWalker};
use crate::property::{DecodedProperty, FormatContext, PropertyError};
use crate::schema::{Schema, SchemaError};

/// Pseudo property name standing for every structure of an event
pub const STRUCTURES_PROPERTY_NAME: &str = "Structures";

/// Decoder module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderError {
    /// Wrapper over a [SchemaError]
    Schema(SchemaError),
    /// Wrapper over a [ParserError]
    Parser(ParserError),
    /// Wrapper over a [PropertyError]
    Property(PropertyError),
    /// No property has this name
    UnknownProperty(String),
    /// The value of the property is not an integer
    InvalidInteger { property: String, value: String },
    /// A hook gave up on the event
    Hook(String),
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(e) => write!(f, "schema error: {}", e),
            Self::Parser(e) => write!(f, "parser error: {}", e),
            Self::Property(e) => write!(f, "property error: {}", e),
            Self::UnknownProperty(name) => write!(f, "unknown property {}", name),
            Self::InvalidInteger { property, value } => {
                write!(f, "property {} is not an integer: {:?}", property, value)
            }
            Self::Hook(reason) => write!(f, "hook failed: {}", reason),
        }
    }
}

impl std::error::Error for DecoderError {}

impl From<SchemaError> for DecoderError {
    fn from(err: SchemaError) -> Self {
        DecoderError::Schema(err)
    }
}

impl From<ParserError> for DecoderError {
    fn from(err: ParserError) -> Self {
        DecoderError::Parser(err)
    }
}

impl From<PropertyError> for DecoderError {
    fn from(err: PropertyError) -> Self {
        DecoderError::Property(err)
    }
}

pub type DecoderResult<T> = Result<T, DecoderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    Initialized,
    MetadataResolved,
    Skippable,
    PropertiesWalked,
    SkippablePostPrepare,
    Built,
}

/// Consumer-supplied checkpoints of the decoding
///
/// All methods have a default implementation that keeps every event whole.
///
/// An error returned by a checkpoint ends the decoding of that event: [`EventDecoder::decode`]
/// returns it, and a [`Consumer`](crate::trace::Consumer) drops the event and reports the error
/// as its last error.
pub trait EventHooks: Send + Sync {
    /// Called before anything is decoded. Returning `false` skips the record
    fn on_record(&self, _record: &EventRecord) -> bool {
        true
    }

    /// Called once the metadata is known, before the user data is walked
    fn on_metadata(&self, _decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
        Ok(())
    }

    /// Called once every property has been located, before any value is formatted
    fn on_prepared(&self, _decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
        Ok(())
    }
}

/// Hooks that keep every event
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl EventHooks for DefaultHooks {}

/// What came out of [`EventDecoder::decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The event, along with the properties that could not be formatted (and were left empty)
    Decoded {
        event: Event,
        property_errors: Vec<PropertyError>,
    },
    /// A hook gave up on this event
    Skipped,
}

/// Decoding state of one record
pub struct EventDecoder<'a> {
    backend: &'a dyn TdhBackend,
    record: &'a EventRecord,
    state: DecoderState,
    schema: Option<Schema>,
    table: PropertyTable,
    selected: HashSet<String>,
    skip: bool,
    skippable: bool,
}

impl<'a> EventDecoder<'a> {
    pub fn new(backend: &'a dyn TdhBackend, record: &'a EventRecord) -> Self {
        Self {
            backend,
            record,
            state: DecoderState::Initialized,
            schema: None,
            table: PropertyTable::default(),
            selected: HashSet::new(),
            skip: false,
            skippable: false,
        }
    }

    /// Runs every decoding step, calling `hooks` at each checkpoint
    ///
    /// # Example
    /// ```
    /// # use etwdecode::native::etw_types::{EventDescriptor, EventHeader, Guid, OwnedEventRecord};
    /// # use etwdecode::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder};
    /// # use etwdecode::native::tdh_types::{TdhInType, TdhOutType};
    /// # use etwdecode::decoder::{DecodeOutcome, DefaultHooks, EventDecoder};
    /// let provider = Guid::from_values(1, 2, 3, [4; 8]);
    /// let tdh = MemoryTdh::new().with_schema(
    ///     SchemaBuilder::new(provider, EventDescriptor::default())
    ///         .property(PropertyDef::value("Pid", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull)),
    /// );
    /// let mut header = EventHeader::default();
    /// header.provider_id = provider;
    /// let record = OwnedEventRecord::new(header, 1234u32.to_le_bytes().to_vec());
    ///
    /// match EventDecoder::new(&tdh, &record).decode(&DefaultHooks).unwrap() {
    ///     DecodeOutcome::Decoded { event, .. } => assert_eq!(event.event_data["Pid"], "1234"),
    ///     DecodeOutcome::Skipped => unreachable!(),
    /// }
    /// ```
    pub fn decode(mut self, hooks: &dyn EventHooks) -> DecoderResult<DecodeOutcome> {
        if !hooks.on_record(self.record) {
            return Ok(DecodeOutcome::Skipped);
        }

        self.resolve_metadata()?;
        self.state = DecoderState::Skippable;
        hooks.on_metadata(&mut self)?;
        if self.skip {
            return Ok(DecodeOutcome::Skipped);
        }

        self.walk_properties()?;
        self.state = DecoderState::SkippablePostPrepare;
        hooks.on_prepared(&mut self)?;
        if self.skip {
            return Ok(DecodeOutcome::Skipped);
        }

        let (event, property_errors) = self.build();
        Ok(DecodeOutcome::Decoded {
            event,
            property_errors,
        })
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn record(&self) -> &EventRecord {
        self.record
    }

    /// `None` until the metadata has been resolved
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn properties(&self) -> &PropertyTable {
        &self.table
    }

    pub fn resolve_metadata(&mut self) -> DecoderResult<&Schema> {
        let schema = match self.schema.take() {
            Some(schema) => schema,
            None => Schema::from_record(self.backend, self.record)?,
        };
        if self.state == DecoderState::Initialized {
            self.state = DecoderState::MetadataResolved;
        }
        let schema: &Schema = self.schema.insert(schema);
        Ok(schema)
    }

    /// Locates every property in the user data
    ///
    /// On failure, the properties located so far stay available, see [`Self::is_aborted`].
    pub fn walk_properties(&mut self) -> DecoderResult<()> {
        let (backend, record) = (self.backend, self.record);
        let schema = self.resolve_metadata()?;
        let table = PropertyWalker::new(backend, record, schema).walk();
        self.table = table;
        self.state = DecoderState::PropertiesWalked;

        match self.table.error() {
            Some(e) => Err(DecoderError::Parser(e.clone())),
            None => Ok(()),
        }
    }

    /// Gives up on this event. Only meaningful from a hook
    pub fn skip(&mut self) {
        self.skip = true;
    }

    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    /// Flags the event as one that can be dropped by whoever consumes it
    pub fn set_skippable(&mut self) {
        self.skippable = true;
    }

    /// Only format these properties (use [`STRUCTURES_PROPERTY_NAME`] for structures)
    ///
    /// Every property is still located, as the offset of a property depends on all the previous ones.
    pub fn select_fields<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected.extend(names.into_iter().map(Into::into));
    }

    fn should_format(&self, name: &str) -> bool {
        self.selected.is_empty() || self.selected.contains(name)
    }

    pub fn is_aborted(&self) -> bool {
        self.table.is_aborted()
    }

    pub fn provider_guid(&self) -> Guid {
        self.schema
            .as_ref()
            .map(|s| s.provider_guid())
            .unwrap_or_else(|| self.record.provider_id())
    }

    pub fn provider_name(&self) -> String {
        self.schema.as_ref().map(|s| s.provider_name()).unwrap_or_default()
    }

    pub fn channel_name(&self) -> String {
        self.schema.as_ref().map(|s| s.channel_name()).unwrap_or_default()
    }

    pub fn event_id(&self) -> u16 {
        self.schema.as_ref().map(|s| s.event_id()).unwrap_or(0)
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.table.names()
    }

    fn context(&self) -> Option<FormatContext<'_>> {
        self.schema.as_ref().map(|schema| FormatContext {
            backend: self.backend,
            record: self.record,
            schema,
        })
    }

    /// The formatted value of a scalar property
    pub fn get_property_string(&self, name: &str) -> DecoderResult<String> {
        let property = self
            .table
            .scalar(name)
            .ok_or_else(|| DecoderError::UnknownProperty(name.to_owned()))?;
        let ctx = self
            .context()
            .ok_or_else(|| DecoderError::UnknownProperty(name.to_owned()))?;
        Ok(property.value(&ctx)?.to_owned())
    }

    /// A scalar property parsed as a signed integer, either decimal or `0x`-prefixed hexadecimal
    pub fn get_property_int(&self, name: &str) -> DecoderResult<i64> {
        let value = self.get_property_string(name)?;
        parse_int(&value).ok_or(DecoderError::InvalidInteger {
            property: name.to_owned(),
            value,
        })
    }

    /// A scalar property parsed as an unsigned integer, either decimal or `0x`-prefixed hexadecimal
    pub fn get_property_uint(&self, name: &str) -> DecoderResult<u64> {
        let value = self.get_property_string(name)?;
        parse_uint(&value).ok_or(DecoderError::InvalidInteger {
            property: name.to_owned(),
            value,
        })
    }

    /// Overrides the value of a scalar property, or adds one
    pub fn set_property(&mut self, name: &str, value: &str) {
        match self.table.scalar_mut(name) {
            Some(property) => property.set_value(value),
            None => self
                .table
                .push_scalar(DecodedProperty::with_value(name, value)),
        }
    }

    /// Formats the value(s) of one property now, without waiting for the event to be built
    pub fn parse_property(&self, name: &str) -> DecoderResult<()> {
        let ctx = match self.context() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };

        if let Some(property) = self.table.scalar(name) {
            property.value(&ctx)?;
        }
        if let Some(elements) = self.table.array(name) {
            for element in elements {
                element.value(&ctx)?;
            }
        }
        if name == STRUCTURES_PROPERTY_NAME {
            for member in self.table.structures().iter().flat_map(|s| s.members()) {
                member.value(&ctx)?;
            }
        }
        Ok(())
    }

    pub fn parse_properties<I, S>(&self, names: I) -> DecoderResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_for_each(|name| self.parse_property(name.as_ref()))
    }

    fn metadata(&self) -> EventMetadata {
        let record = self.record;
        let mut metadata = EventMetadata {
            computer: computer_name().to_owned(),
            process_id: record.process_id(),
            thread_id: record.thread_id(),
            activity_id: record.activity_id(),
            related_activity_id: record.related_activity_id(),
            event_id: self.event_id(),
            version: record.version(),
            channel: record.channel(),
            level: record.level(),
            opcode: record.opcode(),
            task: record.task(),
            keywords: record.keyword(),
            provider_guid: self.provider_guid(),
            timestamp: FileTime::from_quad(record.timestamp()),
            ..Default::default()
        };

        if let Some(schema) = &self.schema {
            metadata.channel_name = schema.channel_name();
            metadata.level_name = schema.level_name();
            metadata.opcode_name = schema.opcode_name();
            metadata.task_name = schema.task_name();
            metadata.keywords_name = schema.keywords_name();
            metadata.provider_name = schema.provider_name();
            if schema.is_mof() {
                metadata.event_type = schema.event_type();
                metadata.event_guid = Some(schema.event_guid());
            }
        }

        metadata
    }

    /// Assembles the event, formatting the selected properties
    ///
    /// A property that cannot be formatted is left empty, and its error is returned along with the event.
    fn build(&mut self) -> (Event, Vec<PropertyError>) {
        let mut errors = Vec::new();
        let mut event = Event {
            user_data_template: self.schema.as_ref().map(|s| s.is_user_data_template()).unwrap_or(false),
            skippable: self.skippable,
            system: self.metadata(),
            ..Default::default()
        };

        if let Some(ctx) = self.context() {
            let mut format = |property: &DecodedProperty| match property.value(&ctx) {
                Ok(v) => v.to_owned(),
                Err(e) => {
                    log::warn!("{}", e);
                    errors.push(e);
                    String::new()
                }
            };

            let mut scalars = HashMap::new();
            for property in self.table.scalars() {
                if self.should_format(property.name()) {
                    scalars.insert(property.name().to_owned(), format(property));
                }
            }
            if event.user_data_template {
                event.user_data = scalars;
            } else {
                event.event_data = scalars;
            }

            for (name, elements) in self.table.arrays() {
                if self.should_format(name) {
                    let values = elements.iter().map(&mut format).collect();
                    event.event_data_arrays.insert(name.to_owned(), values);
                }
            }

            if self.should_format(STRUCTURES_PROPERTY_NAME) {
                event.event_data_structs = self
                    .table
                    .structures()
                    .iter()
                    .map(|s| {
                        s.members()
                            .iter()
                            .map(|m| (m.name().to_owned(), format(m)))
                            .collect()
                    })
                    .collect();
            }
        }

        self.state = DecoderState::Built;
        (event, errors)
    }
}

fn split_radix(value: &str) -> (&str, u32) {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (value, 10),
    }
}

fn parse_uint(value: &str) -> Option<u64> {
    let (digits, radix) = split_radix(value.trim());
    u64::from_str_radix(digits, radix).ok()
}

fn parse_int(value: &str) -> Option<i64> {
    let value = value.trim();
    let (negative, magnitude) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let (digits, radix) = split_radix(magnitude);
    // Goes through i128 so that i64::MIN parses
    let parsed = i128::from_str_radix(digits, radix).ok()?;
    let signed = if negative { -parsed } else { parsed };
    i64::try_from(signed).ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::{DecodingSource, EventDescriptor, EventHeader, OwnedEventRecord, TemplateFlags};
    use crate::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder};
    use crate::native::tdh_types::{TdhInType, TdhOutType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PROVIDER: Guid = Guid::from_values(0x4444, 0, 0, [3; 8]);

    fn builder() -> SchemaBuilder {
        SchemaBuilder::new(PROVIDER, EventDescriptor { id: 5, ..Default::default() })
            .provider_name("Test-Provider")
            .channel_name("Analytic")
            .property(PropertyDef::value("Pid", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull))
            .property(PropertyDef::value("Flags", TdhInType::InTypeUInt32, TdhOutType::OutTypeHexInt32))
    }

    fn record() -> OwnedEventRecord {
        let mut header = EventHeader::default();
        header.provider_id = PROVIDER;
        header.event_descriptor.id = 5;
        header.process_id = 42;
        header.timestamp = 133170048000000000;
        let mut data = 1234u32.to_le_bytes().to_vec();
        data.extend_from_slice(&0x1fu32.to_le_bytes());
        OwnedEventRecord::new(header, data)
    }

    fn decoded(outcome: DecoderResult<DecodeOutcome>) -> Event {
        match outcome {
            Ok(DecodeOutcome::Decoded { event, property_errors }) => {
                assert!(property_errors.is_empty());
                event
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[derive(Default)]
    struct Recording {
        skip_at_metadata: bool,
        skip_at_prepared: bool,
        metadata_calls: AtomicUsize,
        prepared_calls: AtomicUsize,
    }

    impl EventHooks for Recording {
        fn on_metadata(&self, decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(decoder.state(), DecoderState::Skippable);
            if self.skip_at_metadata {
                decoder.skip();
            }
            Ok(())
        }

        fn on_prepared(&self, decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
            self.prepared_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(decoder.property_names(), vec!["Pid", "Flags"]);
            assert!(!decoder.properties().scalar("Pid").unwrap().is_formatted());
            if self.skip_at_prepared {
                decoder.skip();
            }
            Ok(())
        }
    }

    #[test]
    fn test_decode() {
        let tdh = MemoryTdh::new().with_schema(builder());
        let record = record();
        let event = decoded(EventDecoder::new(&tdh, &record).decode(&DefaultHooks));

        assert_eq!(event.event_data["Pid"], "1234");
        assert_eq!(event.event_data["Flags"], "0x1F");
        assert_eq!(event.property("Pid"), Some("1234"));
        assert!(event.user_data.is_empty());
        assert_eq!(event.system.event_id, 5);
        assert_eq!(event.system.process_id, 42);
        assert_eq!(event.system.provider_name, "Test-Provider");
        assert_eq!(event.system.channel_name, "Analytic");
        assert_eq!(event.system.provider_guid, PROVIDER);
        assert_eq!(event.system.timestamp.as_unix_timestamp_secs(), 1672531200);
        assert_eq!(event.system.event_type, None);
    }

    #[test]
    fn test_skip_checkpoints() {
        let tdh = MemoryTdh::new().with_schema(builder());
        let record = record();

        let hooks = Recording {
            skip_at_metadata: true,
            ..Default::default()
        };
        let outcome = EventDecoder::new(&tdh, &record).decode(&hooks);
        assert_eq!(outcome, Ok(DecodeOutcome::Skipped));
        assert_eq!(hooks.metadata_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.prepared_calls.load(Ordering::SeqCst), 0);

        let hooks = Recording {
            skip_at_prepared: true,
            ..Default::default()
        };
        let outcome = EventDecoder::new(&tdh, &record).decode(&hooks);
        assert_eq!(outcome, Ok(DecodeOutcome::Skipped));
        assert_eq!(hooks.prepared_calls.load(Ordering::SeqCst), 1);

        let hooks = Recording::default();
        decoded(EventDecoder::new(&tdh, &record).decode(&hooks));
    }

    #[test]
    fn test_hook_errors() {
        struct Refusing;
        impl EventHooks for Refusing {
            fn on_metadata(&self, decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
                Err(DecoderError::Hook(format!("event {} not allowed", decoder.event_id())))
            }
        }

        struct Missing;
        impl EventHooks for Missing {
            fn on_prepared(&self, decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
                decoder.get_property_uint("Pid")?;
                decoder.get_property_uint("Missing")?;
                Ok(())
            }
        }

        let tdh = MemoryTdh::new().with_schema(builder());
        let record = record();
        assert_eq!(
            EventDecoder::new(&tdh, &record).decode(&Refusing),
            Err(DecoderError::Hook("event 5 not allowed".to_owned()))
        );
        assert_eq!(
            EventDecoder::new(&tdh, &record).decode(&Missing),
            Err(DecoderError::UnknownProperty("Missing".to_owned()))
        );
    }

    #[test]
    fn test_helpers() {
        let tdh = MemoryTdh::new().with_schema(builder());
        let record = record();
        let mut decoder = EventDecoder::new(&tdh, &record);
        decoder.walk_properties().unwrap();

        assert_eq!(decoder.state(), DecoderState::PropertiesWalked);
        assert_eq!(decoder.provider_name(), "Test-Provider");
        assert_eq!(decoder.channel_name(), "Analytic");
        assert_eq!(decoder.event_id(), 5);
        assert_eq!(decoder.get_property_string("Pid"), Ok("1234".to_owned()));
        assert_eq!(decoder.get_property_int("Pid"), Ok(1234));
        assert_eq!(decoder.get_property_uint("Flags"), Ok(0x1f));
        assert_eq!(
            decoder.get_property_string("Nope"),
            Err(DecoderError::UnknownProperty("Nope".to_owned()))
        );

        decoder.set_property("Pid", "-7");
        decoder.set_property("Extra", "value");
        assert_eq!(decoder.get_property_int("Pid"), Ok(-7));
        assert!(matches!(
            decoder.get_property_uint("Extra"),
            Err(DecoderError::InvalidInteger { .. })
        ));
        assert!(decoder.parse_properties(["Flags", STRUCTURES_PROPERTY_NAME]).is_ok());
    }

    #[test]
    fn test_selected_fields() {
        struct OnlyPid;
        impl EventHooks for OnlyPid {
            fn on_metadata(&self, decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
                decoder.select_fields(["Pid"]);
                Ok(())
            }
        }

        let tdh = MemoryTdh::new().with_schema(builder());
        let record = record();
        let event = decoded(EventDecoder::new(&tdh, &record).decode(&OnlyPid));
        assert_eq!(event.event_data.len(), 1);
        assert_eq!(event.event_data["Pid"], "1234");
    }

    #[test]
    fn test_user_data_template() {
        let tdh = MemoryTdh::new().with_schema(builder().template_flags(TemplateFlags::TEMPLATE_USER_DATA));
        let record = record();
        let event = decoded(EventDecoder::new(&tdh, &record).decode(&DefaultHooks));

        assert!(event.event_data.is_empty());
        assert_eq!(event.user_data["Pid"], "1234");
        assert_eq!(event.property("Pid"), Some("1234"));
    }

    #[test]
    fn test_mof_labels() {
        let class = Guid::from_values(1030727889, 0, 0, [0; 8]);
        let tdh = MemoryTdh::new().with_schema(
            SchemaBuilder::new(PROVIDER, EventDescriptor { opcode: 2, ..Default::default() })
                .decoding_source(DecodingSource::DecodingSourceWbem)
                .event_guid(class)
                .opcode_name("End"),
        );
        let mut header = EventHeader::default();
        header.provider_id = PROVIDER;
        header.event_descriptor.opcode = 2;
        let record = OwnedEventRecord::new(header, Vec::new());

        let event = decoded(EventDecoder::new(&tdh, &record).decode(&DefaultHooks));
        assert_eq!(event.system.event_type.as_deref(), Some("Thread/End"));
        assert_eq!(event.system.event_guid, Some(class));
    }

    #[test]
    fn test_missing_metadata() {
        let tdh = MemoryTdh::new();
        let record = record();
        assert!(matches!(
            EventDecoder::new(&tdh, &record).decode(&DefaultHooks),
            Err(DecoderError::Schema(SchemaError::MetadataUnavailable(_)))
        ));
    }

    #[test]
    fn test_integer_parsing() {
        assert_eq!(parse_uint("0x10"), Some(16));
        assert_eq!(parse_uint("42"), Some(42));
        assert_eq!(parse_uint("-1"), None);
        assert_eq!(parse_int("-0x10"), Some(-16));
        assert_eq!(parse_int("-9223372036854775808"), Some(i64::MIN));
        assert_eq!(parse_int("abc"), None);
    }
}
