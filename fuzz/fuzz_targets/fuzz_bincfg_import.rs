//! Fuzz target: `bincfg::import`
//!
//! Arbitrary framed buffers must never panic the importer, and anything
//! it accepts must survive an export/import round trip.
//!
//! cargo fuzz run fuzz_bincfg_import

#![no_main]

use libfuzzer_sys::fuzz_target;
use sercos3::bincfg;

fuzz_target!(|data: &[u8]| {
    if let Ok(configs) = bincfg::import(data) {
        let exported = bincfg::export(&configs);
        let reimported = bincfg::import(&exported).expect("round trip must hold");
        assert_eq!(reimported.len(), configs.len());
    }
});
