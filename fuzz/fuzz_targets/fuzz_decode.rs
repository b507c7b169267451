#![no_main]

use libfuzzer_sys::fuzz_target;

use phoenix_channel_client::{Frame, Serializer};

fuzz_target!(|data: &[u8]| {
    // Exercise the binary framing path (kind tag, length prefixes, UTF-8
    // meta fields) on raw bytes.
    let _ = Serializer.decode(&Frame::Binary(data.to_vec()));

    // Also exercise the text array path for valid UTF-8 input.
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = Serializer.decode(&Frame::Text(text.to_string()));
    }
});
