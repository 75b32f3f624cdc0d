#![no_main]

use libfuzzer_sys::fuzz_target;
use sphalerite::frame::{apply_mask, FrameHeader};
use sphalerite::Utf8Validator;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((header, header_len))) = FrameHeader::parse(data) {
        let payload_len = usize::try_from(header.payload_len).unwrap_or(usize::MAX);
        let end = header_len.saturating_add(payload_len).min(data.len());
        let mut payload = data[header_len..end].to_vec();
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }
        let mut validator = Utf8Validator::new();
        let _ = validator.feed(&payload);
    }
});
