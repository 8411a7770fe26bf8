// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reframes arbitrary bytes. Ensures the following:
//! *   there are no crashes.
//! *   the length is preserved.
//! *   every byte not overwritten by a start code is unchanged.

#![no_main]
use libfuzzer_sys::fuzz_target;
use mp4decode::reframe;

fuzz_target!(|data: &[u8]| {
    let mut buf = data.to_vec();
    reframe::to_annex_b(&mut buf, reframe::SUPPORTED_LENGTH_SIZE).unwrap();
    assert_eq!(buf.len(), data.len());
    let mut pos = 0usize;
    while data.len() - pos >= 4 {
        assert_eq!(&buf[pos..pos + 4], &[0, 0, 0, 1]);
        let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let end = match (pos + 4).checked_add(len) {
            Some(e) if e <= data.len() => e,
            _ => break,
        };
        assert_eq!(&buf[pos + 4..end], &data[pos + 4..end]);
        pos = end;
    }
});
