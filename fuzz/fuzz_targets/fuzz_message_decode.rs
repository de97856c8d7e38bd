//! Fuzz target for replication message framing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use log_replication_engine::message::ReplicationMessage;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = ReplicationMessage::from_bytes(data) else {
        return;
    };
    // Payload decoding must fail cleanly, not panic.
    let _ = message.entry();

    let bytes = message.to_bytes().expect("re-encode decoded message");
    let again = ReplicationMessage::from_bytes(&bytes).expect("decode re-encoded message");
    assert_eq!(again.kind, message.kind);
    assert_eq!(again.sequence_number, message.sequence_number);
    assert_eq!(again.timestamp, message.timestamp);
    assert_eq!(again.payload, message.payload);
});
