use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;

use crate::decoder::{DecodeOutcome, EventDecoder, EventHooks};
use crate::event::Event;
use crate::native::etw_types::{EventRecord, Guid};
use crate::native::evntrace::TraceCallbacks;
use crate::native::tdh::TdhBackend;
use crate::trace::{ConsumerState, TraceError};

/// Provider of the records real-time sessions emit when they lose events (`RT_LostEvent`)
pub const LOST_EVENT_GUID: Guid = Guid::from_values(
    0x6a39_9ae0,
    0x4bc6,
    0x4de9,
    [0x87, 0x0b, 0x36, 0x57, 0xf8, 0x94, 0x7e, 0x7e],
);

/// Data used by callbacks when the trace is running
///
/// One instance exists per open trace. It is only accessed from the thread processing that
/// trace, apart from the shared [`ConsumerState`].
pub struct CallbackData {
    backend: Arc<dyn TdhBackend>,
    hooks: Arc<dyn EventHooks>,
    sender: SyncSender<Event>,
    state: Arc<ConsumerState>,
}

impl CallbackData {
    pub(crate) fn new(
        backend: Arc<dyn TdhBackend>,
        hooks: Arc<dyn EventHooks>,
        sender: SyncSender<Event>,
        state: Arc<ConsumerState>,
    ) -> Self {
        Self {
            backend,
            hooks,
            sender,
            state,
        }
    }

    fn deliver(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.state.count_dropped(),
            // Nobody is listening anymore
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl TraceCallbacks for CallbackData {
    fn on_buffer(&self) -> bool {
        !self.state.is_cancelled()
    }

    fn on_event(&self, record: &EventRecord) {
        if record.provider_id() == LOST_EVENT_GUID {
            self.state.count_lost();
            return;
        }
        if self.state.is_cancelled() {
            return;
        }

        match EventDecoder::new(self.backend.as_ref(), record).decode(self.hooks.as_ref()) {
            Ok(DecodeOutcome::Decoded {
                event,
                property_errors,
            }) => {
                for err in property_errors {
                    self.state.record_error(TraceError::Property(err));
                }
                if !self.state.is_cancelled() {
                    self.deliver(event);
                }
            }
            Ok(DecodeOutcome::Skipped) => self.state.count_skipped(),
            Err(err) => {
                log::error!(
                    "dropping event {} of provider {:?}: {}",
                    record.event_id(),
                    record.provider_id(),
                    err
                );
                self.state.record_error(TraceError::Decoder(err));
            }
        }
    }
}

impl std::fmt::Debug for CallbackData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackData")
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoder::DefaultHooks;
    use crate::native::etw_types::{EventDescriptor, EventHeader, OwnedEventRecord};
    use crate::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder};
    use crate::native::tdh_types::{TdhInType, TdhOutType};
    use std::sync::mpsc::sync_channel;

    const PROVIDER: Guid = Guid::from_values(0x5555, 0, 0, [5; 8]);

    fn callbacks(capacity: usize) -> (CallbackData, std::sync::mpsc::Receiver<Event>) {
        let tdh = MemoryTdh::new().with_schema(
            SchemaBuilder::new(PROVIDER, EventDescriptor::default())
                .property(PropertyDef::value("Value", TdhInType::InTypeUInt8, TdhOutType::OutTypeNull)),
        );
        let (sender, receiver) = sync_channel(capacity);
        let data = CallbackData::new(
            Arc::new(tdh),
            Arc::new(DefaultHooks),
            sender,
            Arc::new(ConsumerState::default()),
        );
        (data, receiver)
    }

    fn record(value: u8) -> OwnedEventRecord {
        let mut header = EventHeader::default();
        header.provider_id = PROVIDER;
        OwnedEventRecord::new(header, vec![value])
    }

    #[test]
    fn test_full_channel_drops() {
        let (data, receiver) = callbacks(2);
        for i in 0..3 {
            data.on_event(&record(i));
        }

        assert_eq!(data.state.dropped.load(std::sync::atomic::Ordering::Relaxed), 1);
        let values: Vec<_> = receiver.try_iter().map(|e| e.event_data["Value"].clone()).collect();
        assert_eq!(values, ["0", "1"]);
    }

    #[test]
    fn test_cancelled() {
        let (data, receiver) = callbacks(8);
        assert!(data.on_buffer());

        data.state.cancel();
        data.on_event(&record(1));

        assert!(!data.on_buffer());
        assert!(receiver.try_recv().is_err());
    }
}
