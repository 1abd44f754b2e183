#![no_main]

use harmoniq_fx_client::{decode_parameters, encode_parameters};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(entries) = decode_parameters(data) {
        let encoded = encode_parameters(&entries);
        assert_eq!(decode_parameters(&encoded).ok(), Some(entries));
    }
});
