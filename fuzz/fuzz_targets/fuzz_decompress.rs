//! Fuzz target for payload decoding.
//!
//! `maybe_decompress` and `OpaqueEntry::decode` must never panic on
//! arbitrary input; a payload arriving from the wire is untrusted.

#![no_main]

use libfuzzer_sys::fuzz_target;
use log_replication_engine::message::{maybe_decompress, OpaqueEntry};

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);

    if let Ok(entry) = OpaqueEntry::decode(data) {
        // Anything that decodes re-encodes to an equal entry.
        let encoded = entry.encode().expect("re-encode decoded entry");
        let again = OpaqueEntry::decode(&encoded).expect("decode re-encoded entry");
        assert_eq!(entry.version, again.version);
        assert_eq!(entry.entries, again.entries);
    }
});
