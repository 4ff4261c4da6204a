//! Fuzz target for decoding documents and checkpoints from JSON.
//!
//! Arbitrary bytes from a remote must never panic the decoder, and a
//! decoded document must hash the same after re-encoding.

#![no_main]

use doc_replication::revision::content_hash;
use doc_replication::{Checkpoint, DocumentState};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    // Checkpoints are opaque; stacking anything must not panic
    let checkpoint = Checkpoint::from(value.clone());
    let _ = Checkpoint::stack_all([Some(checkpoint.clone()), None, Some(checkpoint)]);

    let Ok(doc) = DocumentState::from_value(value) else {
        return;
    };
    let hash = content_hash(&doc.content());
    let encoded = serde_json::to_value(&doc).expect("encode");
    let decoded = DocumentState::from_value(encoded).expect("re-decode");
    assert_eq!(content_hash(&decoded.content()), hash);
});
