#![no_main]
use ciborium::de::from_reader;
use libfuzzer_sys::fuzz_target;
use tandem_core::BackendArtifact;

fuzz_target!(|data: &[u8]| {
    let _ = from_reader::<BackendArtifact, _>(data);
});
