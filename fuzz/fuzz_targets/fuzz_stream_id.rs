//! Fuzz target for stream id handling.
//!
//! Parsing arbitrary strings never panics, and names map to ids
//! deterministically with live and shadow ids kept apart.

#![no_main]

use libfuzzer_sys::fuzz_target;
use log_replication_engine::StreamId;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    if let Ok(id) = StreamId::parse(a) {
        assert_eq!(StreamId::parse(&id.to_string()).ok(), Some(id));
    }

    assert_eq!(StreamId::from_name(a), StreamId::from_name(a));
    assert_ne!(StreamId::from_name(a), StreamId::shadow_of(a));
    if a != b {
        assert_ne!(StreamId::from_name(a), StreamId::from_name(b));
    }
});
