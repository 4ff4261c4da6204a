//! Fuzz target for revision parsing and ordering.
//!
//! Parsing must never panic, and every parsed revision must survive a
//! display/parse round trip with a consistent ordering.

#![no_main]

use doc_replication::revision::parse_height;
use doc_replication::Revision;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    // Should never panic
    let _ = parse_height(a);
    let (Ok(ra), Ok(rb)) = (a.parse::<Revision>(), b.parse::<Revision>()) else {
        return;
    };

    assert!(ra.height() > 0);
    assert_eq!(ra.to_string().parse::<Revision>().ok(), Some(ra.clone()));

    // Antisymmetry
    assert_eq!(ra.cmp(&rb).reverse(), rb.cmp(&ra));
    if ra.height() != rb.height() {
        assert_eq!(ra.cmp(&rb), ra.height().cmp(&rb.height()));
    } else if ra.hash() == rb.hash() {
        assert_eq!(ra.cmp(&rb), Ordering::Equal);
    }
});
