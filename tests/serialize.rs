#![cfg(feature = "serde")]

use etwdecode::decoder::{DecodeOutcome, DefaultHooks, EventDecoder};
use etwdecode::native::etw_types::{DecodingSource, EventDescriptor, EventHeader, Guid, OwnedEventRecord};
use etwdecode::native::memory::{MemoryTdh, SchemaBuilder};
use etwdecode::{EventSerializer, EventSerializerOptions};

mod utils;
use utils::*;

fn decode(tdh: &MemoryTdh, record: &OwnedEventRecord) -> etwdecode::Event {
    match EventDecoder::new(tdh, record).decode(&DefaultHooks).unwrap() {
        DecodeOutcome::Decoded { event, .. } => event,
        DecodeOutcome::Skipped => panic!("nothing should be skipped"),
    }
}

#[test]
fn manifest_event() {
    let tdh = process_tdh();
    let record = process_record("abc", &[0xde, 0xad]).with_related_activity_id(Guid::from_values(7, 7, 7, [7; 8]));
    let event = decode(&tdh, &record);

    let json = serde_json::to_value(&event).unwrap();
    println!("{}", json);

    assert_eq!(json["EventData"]["Name"], "abc");
    assert_eq!(json["EventData"]["Data"], "0xDEAD");
    assert_eq!(json["System"]["EventID"], EVENT_ID);
    assert_eq!(json["System"]["Provider"]["Name"], "Microsoft-Windows-Kernel-Process");
    assert_eq!(json["System"]["Execution"]["ProcessID"], 1234);
    assert_eq!(
        json["System"]["Correlation"]["RelatedActivityID"],
        Guid::from_values(7, 7, 7, [7; 8]).to_string()
    );
    assert!(json.get("UserData").is_none());

    #[cfg(not(feature = "time_rs"))]
    assert_eq!(json["System"]["TimeCreated"], 1_672_531_200_000i64);
}

#[test]
fn mof_event() {
    // Process class
    let class = Guid::from_values(0x3d6fa8d0, 0xfe05, 0x11d0, [0x9d, 0xda, 0x00, 0xc0, 0x4f, 0xd7, 0xba, 0x7c]);
    let tdh = MemoryTdh::new().with_schema(
        SchemaBuilder::new(PROVIDER, EventDescriptor { opcode: 1, ..Default::default() })
            .decoding_source(DecodingSource::DecodingSourceWbem)
            .event_guid(class)
            .opcode_name("Start"),
    );
    let mut header = EventHeader::default();
    header.provider_id = PROVIDER;
    header.event_descriptor.opcode = 1;
    let event = decode(&tdh, &OwnedEventRecord::new(header, Vec::new()));

    let options = EventSerializerOptions {
        include_empty: true,
        ..Default::default()
    };
    let json = serde_json::to_value(EventSerializer::new(&event, options)).unwrap();

    assert_eq!(json["System"]["EventType"], "Process/Start");
    assert_eq!(json["System"]["EventGuid"], class.to_string());
    // Process is the 17th known class
    assert_eq!(json["System"]["EventID"], 17 * 0x100 + 1);
    assert_eq!(json["System"]["Opcode"]["Value"], 1);
    assert_eq!(json["EventData"], serde_json::json!({}));
}
