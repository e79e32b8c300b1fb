#![no_main]
use ciborium::de::from_reader;
use libfuzzer_sys::fuzz_target;
use tandem_core::Protocol;

fuzz_target!(|data: &[u8]| {
    if let Ok(p) = from_reader::<Protocol, _>(data) {
        // Validation must reject garbage, never panic on it.
        let _ = tandem_core::validate(&p);
    }
});
