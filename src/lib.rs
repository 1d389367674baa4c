//! # Decoding ETW events
//! This crate turns the raw records delivered by real-time Event Tracing for Windows (ETW) sessions
//! into structured events, with named and formatted properties.
//!
//! # What's ETW
//! Event Tracing for Windows (ETW) is an efficient kernel-level tracing facility that lets you log
//! kernel or application-defined events to a log file. You can consume the events in real time or
//! from a log file and use them to debug an application or to determine where performance issues
//! are occurring in the application. [Source]
//!
//! Consuming an event means finding its schema (the `TRACE_EVENT_INFO` the Trace Data Helper, or TDH,
//! knows about), locating each of its properties in the user data (whose size may depend on the value
//! of previous properties), and finally formatting them. This crate does all of this for you:
//!
//! * [`schema`] gives a bounds-checked view over the metadata of an event,
//! * [`parser`] walks the user data and locates every property, array element and structure member,
//! * [`property`] formats values (lazily, and at most once),
//! * [`decoder`] drives the above for a single record, with hooks to skip events early or to only
//!   format the properties you care about,
//! * [`trace`] consumes real-time sessions on worker threads, and hands decoded [`Event`]s over a bounded channel.
//!
//! All OS interaction goes through the [`native::tdh::TdhBackend`] and [`native::evntrace::TraceProcessor`]
//! traits. On Windows they are implemented over the actual APIs; [`native::memory`] provides portable
//! implementations that work from registered schemas and pre-recorded records.
//!
//! # Getting started
//! ```
//! use etwdecode::decoder::{DecoderResult, EventDecoder, EventHooks};
//! use etwdecode::native::etw_types::{EventDescriptor, EventHeader, Guid, OwnedEventRecord};
//! use etwdecode::native::memory::{MemoryTdh, PropertyDef, ReplayProcessor, SchemaBuilder};
//! use etwdecode::native::tdh_types::{TdhInType, TdhOutType};
//! use etwdecode::ConsumerBuilder;
//!
//! // Only keep events from process 4, and only format their `ImageName`
//! struct SystemImages;
//! impl EventHooks for SystemImages {
//!     fn on_metadata(&self, decoder: &mut EventDecoder<'_>) -> DecoderResult<()> {
//!         if decoder.record().process_id() != 4 {
//!             decoder.skip();
//!         }
//!         decoder.select_fields(["ImageName"]);
//!         Ok(())
//!     }
//! }
//!
//! let provider = Guid::from_values(0x22fb2cd6, 0x0e7b, 0x422b, [0xa0, 0xc7, 0x2f, 0xad, 0x1f, 0xd0, 0xe7, 0x16]);
//! let tdh = MemoryTdh::new().with_schema(
//!     SchemaBuilder::new(provider, EventDescriptor { id: 5, ..Default::default() })
//!         .provider_name("Microsoft-Windows-Kernel-Process")
//!         .property(PropertyDef::value("ImageBase", TdhInType::InTypePointer, TdhOutType::OutTypeNull))
//!         .property(PropertyDef::value("ImageName", TdhInType::InTypeUnicodeString, TdhOutType::OutTypeNull)),
//! );
//!
//! let mut header = EventHeader::default();
//! header.provider_id = provider;
//! header.event_descriptor.id = 5;
//! header.process_id = 4;
//! let mut user_data = 0x1000u64.to_le_bytes().to_vec();
//! user_data.extend("ntdll.dll\0".encode_utf16().flat_map(|u| u.to_le_bytes()));
//! let replay = ReplayProcessor::new().with_trace("MyTrace", vec![OwnedEventRecord::new(header, user_data)]);
//!
//! // Real-time sessions would use `ConsumerBuilder::new()` and the default backend instead
//! let mut consumer = ConsumerBuilder::with_processor(replay)
//!     .trace_names(["MyTrace"])
//!     .backend(tdh)
//!     .hooks(SystemImages)
//!     .build()
//!     .unwrap();
//! let events = consumer.events().unwrap();
//! consumer.start().unwrap();
//! // Replayed traces end on their own, real-time ones would keep running until stopped
//! consumer.wait();
//! consumer.stop().unwrap();
//!
//! let received: Vec<_> = events.iter().collect();
//! assert_eq!(received.len(), 1);
//! for event in received {
//!     assert_eq!(event.system.provider_name, "Microsoft-Windows-Kernel-Process");
//!     assert_eq!(event.property("ImageName"), Some("ntdll.dll"));
//!     assert_eq!(event.property("ImageBase"), None);
//! }
//! ```
//!
//! [Source]: https://docs.microsoft.com/en-us/windows/win32/etw/about-event-tracing
//!
//! # Log messages
//! etwdecode may occasionally write log messages using the [`log`](https://docs.rs/log/latest/log/) crate,
//! e.g. when a record cannot be decoded and is dropped.<br/>
//! In case you want them to be printed to the console, your binary should use one of the various logger
//! implementations. [`env_logger`](https://docs.rs/env_logger/latest/env_logger/) is one of them.

#[cfg(test)]
#[macro_use]
extern crate memoffset;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate num_derive;
extern crate num_traits;

pub mod decoder;
pub mod event;
pub mod native;
pub mod parser;
pub mod property;
pub mod schema;
pub mod ser;
pub mod trace;
mod traits;

// Convenience re-exports.
pub use crate::decoder::{DecodeOutcome, EventDecoder, EventHooks};
pub use crate::event::{Event, EventMetadata};
pub use crate::native::etw_types::{EventRecord, Guid, OwnedEventRecord};
#[cfg(feature = "serde")]
pub use crate::ser::{EventSerializer, EventSerializerOptions};
pub use crate::trace::{Consumer, ConsumerBuilder, TraceError};
