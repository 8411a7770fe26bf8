// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decodes a stream of arbitrary samples and seeks within it. Ensures the
//! following:
//! *   there are no crashes.
//! *   errors affect only the call that returned them.
//! *   end of stream is reached and is stable.

#![no_main]
use std::num::NonZeroU32;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use mp4decode::testutil::{self, ReorderingLibrary};
use mp4decode::{SampleTable, Session};

fuzz_target!(|data: &[u8]| {
    let Some((&control, mut rest)) = data.split_first() else {
        return;
    };
    let mut b = SampleTable::builder(
        NonZeroU32::new(testutil::TIMESCALE).unwrap(),
        testutil::WIDTH,
        testutil::HEIGHT,
    )
    .parameter_set(Bytes::from_static(testutil::SPS))
    .parameter_set(Bytes::from_static(testutil::PPS));

    // Each sample: a flags byte (bit 0 = sync), a size byte, then the payload.
    let mut ct = 0;
    while let [flags, size, tail @ ..] = rest {
        let size = usize::from(*size).min(tail.len());
        b = b.sample(ct, testutil::FRAME_DELTA, flags & 1 != 0, &tail[..size]);
        ct += i64::from(testutil::FRAME_DELTA);
        rest = &tail[size..];
    }
    let table = b.build();
    let samples = table.samples().len();
    let lib = ReorderingLibrary::new(usize::from(control & 3));
    let mut session = Session::open(table, &lib).unwrap();
    session.initialize().unwrap();
    if control & 4 != 0 {
        let _ = session.seek(i64::from(control >> 3) * i64::from(testutil::FRAME_DELTA));
    }

    // Every sample fails at most once, then draining ends the stream.
    let mut reads = 0;
    loop {
        match session.read_next_frame() {
            Ok(Some(_)) | Err(_) => reads += 1,
            Ok(None) => break,
        }
        assert!(reads <= 2 * samples + 2, "no end of stream after {reads} reads");
    }
    assert!(session.read_next_frame().unwrap().is_none());
    session.close().unwrap();
});
