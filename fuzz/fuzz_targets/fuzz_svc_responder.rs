//! Fuzz target: slave-side service channel responder
//!
//! Feeds arbitrary 4-byte control/data fields into the responder's word
//! protocol. The responder must never panic and must always produce a
//! well-formed 4-byte reply, whatever the master throws at it.
//!
//! cargo fuzz run fuzz_svc_responder

#![no_main]

use libfuzzer_sys::fuzz_target;
use sercos3::svc::responder::{ParamDef, SvcResponder};
use sercos3::svc::{Eidn, ATTR_LEN_LONG};

fuzz_target!(|data: &[u8]| {
    let mut responder = SvcResponder::new();
    responder.install(Eidn::s(32), ParamDef::value(ATTR_LEN_LONG, vec![1, 2, 3, 4]));
    responder.install(Eidn::s(99), ParamDef::command(2));

    let mut at = [0u8; 4];
    for field in data.chunks_exact(4) {
        responder.exchange(field, &mut at);
    }
});
