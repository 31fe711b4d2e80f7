//! Fuzz target: `telegram::frame::parse`
//!
//! Drives arbitrary byte sequences into the frame parser and asserts that
//! it never panics, that accepted frames stay inside their own bytes, and
//! that a compose/parse round trip preserves the header.
//!
//! cargo fuzz run fuzz_telegram_parse

#![no_main]

use libfuzzer_sys::fuzz_target;
use sercos3::telegram::frame;

fuzz_target!(|data: &[u8]| {
    if let Ok(parsed) = frame::parse(data) {
        // The payload view must be a suffix of the input.
        assert!(parsed.payload.len() <= data.len());
        assert!(parsed.header.slot < 4);
        assert!(parsed.header.phase <= 4);

        let mut out = vec![0u8; data.len()];
        let len = frame::compose(&parsed.header, parsed.src_mac, parsed.payload, &mut out);
        let reparsed = frame::parse(&out[..len]).expect("recomposed frame must parse");
        assert_eq!(reparsed.header, parsed.header);
    }
});
