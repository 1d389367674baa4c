#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::mpsc::{RecvTimeoutError, TrySendError};
use std::time::Duration;

use etwdecode::native::etw_types::{EventDescriptor, EventHeader, EventRecord, Guid, OwnedEventRecord};
use etwdecode::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder};
use etwdecode::native::tdh::{
    FormatOutcome, FormatRequest, PropertyDataDescriptor, TdhBackend, TdhNativeResult,
};
use etwdecode::native::tdh_types::{TdhInType, TdhOutType};

/// Microsoft-Windows-Kernel-Process
pub const PROVIDER: Guid = Guid::from_values(
    0x22fb2cd6,
    0x0e7b,
    0x422b,
    [0xa0, 0xc7, 0x2f, 0xad, 0x1f, 0xd0, 0xe7, 0x16],
);

pub const EVENT_ID: u16 = 5;

// 2023-01-01T00:00:00Z
pub const NEW_YEAR_2023: i64 = 133_170_048_000_000_000;

/// A [`TdhBackend`] that counts how many times each operation is called
pub struct CountingTdh<B> {
    inner: B,
    pub event_information: AtomicUsize,
    pub format_property: AtomicUsize,
    pub property_size: AtomicUsize,
}

impl<B: TdhBackend> CountingTdh<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            event_information: AtomicUsize::new(0),
            format_property: AtomicUsize::new(0),
            property_size: AtomicUsize::new(0),
        }
    }

    pub fn format_calls(&self) -> usize {
        self.format_property.load(Ordering::SeqCst)
    }
}

impl<B: TdhBackend> TdhBackend for CountingTdh<B> {
    fn event_information(&self, record: &EventRecord, buffer: &mut [u8]) -> TdhNativeResult<u32> {
        self.event_information.fetch_add(1, Ordering::SeqCst);
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
        self.format_property.fetch_add(1, Ordering::SeqCst);
        self.inner.format_property(request, buffer)
    }

    fn property_size(
        &self,
        record: &EventRecord,
        path: &[PropertyDataDescriptor<'_>],
    ) -> TdhNativeResult<u32> {
        self.property_size.fetch_add(1, Ordering::SeqCst);
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

/// `ProcessStart`-like event: `Name` (string), `DataLength` (u32), `Data` (`DataLength` bytes)
pub fn process_schema() -> SchemaBuilder {
    SchemaBuilder::new(
        PROVIDER,
        EventDescriptor {
            id: EVENT_ID,
            level: 4,
            ..Default::default()
        },
    )
    .provider_name("Microsoft-Windows-Kernel-Process")
    .level_name("Information")
    .task_name("ProcessStart")
    .property(PropertyDef::value(
        "Name",
        TdhInType::InTypeUnicodeString,
        TdhOutType::OutTypeNull,
    ))
    .property(PropertyDef::value(
        "DataLength",
        TdhInType::InTypeUInt32,
        TdhOutType::OutTypeNull,
    ))
    .property(
        PropertyDef::value("Data", TdhInType::InTypeBinary, TdhOutType::OutTypeHexBinary)
            .with_length_from(1),
    )
}

pub fn process_tdh() -> MemoryTdh {
    MemoryTdh::new().with_schema(process_schema())
}

pub fn utf16z(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|u| u.to_le_bytes())
        .collect()
}

pub fn process_user_data(name: &str, data: &[u8]) -> Vec<u8> {
    let mut user_data = utf16z(name);
    user_data.extend_from_slice(&(data.len() as u32).to_le_bytes());
    user_data.extend_from_slice(data);
    user_data
}

pub fn header(provider: Guid, id: u16) -> EventHeader {
    let mut header = EventHeader::default();
    header.provider_id = provider;
    header.event_descriptor.id = id;
    header.process_id = 1234;
    header.thread_id = 5678;
    header.timestamp = NEW_YEAR_2023;
    header
}

pub fn process_record(name: &str, data: &[u8]) -> OwnedEventRecord {
    OwnedEventRecord::new(header(PROVIDER, EVENT_ID), process_user_data(name, data))
}

#[derive(Clone, Debug)]
pub enum TestKind {
    /// Test will pass if a success has been notified in the test duration
    ExpectSuccess,
    /// Test will pass if no failure has been notified in the test duration
    ExpectNoFailure,
}

#[derive(Clone, Debug)] // mpsc channels are clone-able to be shared between threads
pub struct StatusNotifier {
    kind: TestKind,
    tx: mpsc::SyncSender<()>,
}

impl StatusNotifier {
    pub fn notify_success(&self) {
        if let TestKind::ExpectSuccess = self.kind {
            self.notify();
        }
    }

    pub fn notify_failure(&self) {
        if let TestKind::ExpectNoFailure = self.kind {
            self.notify();
        }
    }

    fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => (), // we've already notified, we don't care
            Err(TrySendError::Disconnected(_)) => (), // the test is over, the callback outlived it
        }
    }
}

#[derive(Debug)]
pub struct Status {
    notifier: StatusNotifier,
    rx: mpsc::Receiver<()>,
}

impl Status {
    pub fn new(kind: TestKind) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self {
            notifier: StatusNotifier { kind, tx },
            rx,
        }
    }

    pub fn notifier(&self) -> StatusNotifier {
        self.notifier.clone()
    }

    pub fn assert_passed(&self) {
        let timeout = Duration::from_secs(10);

        match self.notifier.kind {
            TestKind::ExpectSuccess => match self.rx.recv_timeout(timeout) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    panic!("Test did not pass within the allowed timeout")
                }
                _ => panic!("Should not happen, the sending end has not hung up."),
            },

            TestKind::ExpectNoFailure => match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(()) => panic!("Test failed within the allowed timeout"),
                Err(RecvTimeoutError::Timeout) => {}
                _ => panic!("Should not happen, the sending end has not hung up."),
            },
        }
    }
}
