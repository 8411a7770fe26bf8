// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The demuxer side: video samples in decode order, plus an in-memory
//! [`SampleTable`] implementation.

use std::num::NonZeroU32;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// One coded video sample (access unit), as indexed by the demuxer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Decode-order number, unique and increasing within a stream. Used as the
    /// key to match decoder output back to this sample.
    pub number: u64,

    /// Presentation time, in [`StreamInfo::timescale`] units.
    pub composition_time: i64,

    /// Display duration, in [`StreamInfo::timescale`] units.
    pub time_delta: u32,

    /// Width of each NAL unit's length prefix.
    pub nal_length_size: u8,

    /// True iff this sample is a random access point (an IDR picture).
    pub is_sync: bool,

    /// Location of the payload within the source; opaque to this crate.
    pub offset: u64,
    pub size: u32,
}

impl Sample {
    /// Returns the end of the presentation interval, exclusive.
    pub fn end_time(&self) -> i64 {
        self.composition_time + i64::from(self.time_delta)
    }

    /// Returns true iff `t` falls within `[composition_time, end_time())`.
    pub fn contains(&self, t: i64) -> bool {
        (self.composition_time..self.end_time()).contains(&t)
    }
}

/// Track-level information, available once the source is initialized.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Total duration, in `timescale` units.
    pub duration: i64,

    /// Time units per second.
    pub timescale: NonZeroU32,

    pub width: u32,
    pub height: u32,

    /// Number of video samples.
    pub samples: u64,

    /// SPS/PPS NAL units (each including its header byte, without a length
    /// prefix) from the `avcC` box.
    pub parameter_sets: Vec<Bytes>,
}

/// A demuxer yielding one video track's samples in decode order.
pub trait SampleSource {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reads whatever headers are necessary to fill [`SampleSource::info`]
    /// and positions the source at the first sample.
    fn initialize(&mut self) -> Result<(), Self::Error>;

    fn info(&self) -> &StreamInfo;

    /// Returns the next sample in decode order, or `None` at end of stream.
    fn next_sample(&mut self) -> Result<Option<Sample>, Self::Error>;

    /// Repositions to the random access point at or before `target`.
    ///
    /// If `exact` is true, `target` must lie within the stream; otherwise it
    /// is clamped. Returns true if the following `next_sample` won't simply
    /// continue where reading left off (a discontinuity).
    fn seek(&mut self, target: i64, exact: bool) -> Result<bool, Self::Error>;

    /// Replaces `buf`'s contents with `sample`'s payload.
    fn read_payload(&mut self, sample: &Sample, buf: &mut Vec<u8>) -> Result<(), Self::Error>;

    fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SampleTableError {
    #[error("sample {number} payload range {start}+{size} exceeds the {len}-byte sample data")]
    PayloadOutOfRange {
        number: u64,
        start: u64,
        size: u32,
        len: usize,
    },

    #[error("seek target {target} is outside [0, {duration})")]
    TargetOutOfRange { target: i64, duration: i64 },

    #[error("stream has no sync samples")]
    NoSyncSample,
}

/// A [`SampleSource`] over an already-demuxed sample index and payload data.
///
/// Useful when samples come from something other than a file (an RTSP
/// recording, a fragmented MP4 held in memory) or for tests.
#[derive(Debug)]
pub struct SampleTable {
    info: StreamInfo,
    samples: Vec<Sample>,
    data: Bytes,

    /// Index into `samples` of the next sample to return.
    next: usize,
}

impl SampleTable {
    pub fn builder(timescale: NonZeroU32, width: u32, height: u32) -> SampleTableBuilder {
        SampleTableBuilder {
            timescale,
            width,
            height,
            duration: None,
            parameter_sets: Vec::new(),
            nal_length_size: 4,
            samples: Vec::new(),
            data: BytesMut::new(),
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl SampleSource for SampleTable {
    type Error = SampleTableError;

    fn initialize(&mut self) -> Result<(), Self::Error> {
        self.next = 0;
        Ok(())
    }

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_sample(&mut self) -> Result<Option<Sample>, Self::Error> {
        let s = self.samples.get(self.next).cloned();
        if s.is_some() {
            self.next += 1;
        }
        Ok(s)
    }

    fn seek(&mut self, target: i64, exact: bool) -> Result<bool, Self::Error> {
        let duration = self.info.duration;
        if exact && !(0..duration).contains(&target) {
            return Err(SampleTableError::TargetOutOfRange { target, duration });
        }
        let i = self
            .samples
            .iter()
            .rposition(|s| s.is_sync && s.composition_time <= target)
            .or_else(|| self.samples.iter().position(|s| s.is_sync))
            .ok_or(SampleTableError::NoSyncSample)?;
        let discontinuity = i != self.next;
        self.next = i;
        Ok(discontinuity)
    }

    fn read_payload(&mut self, sample: &Sample, buf: &mut Vec<u8>) -> Result<(), Self::Error> {
        let out_of_range = || SampleTableError::PayloadOutOfRange {
            number: sample.number,
            start: sample.offset,
            size: sample.size,
            len: self.data.len(),
        };
        let start = usize::try_from(sample.offset).map_err(|_| out_of_range())?;
        let end = start
            .checked_add(sample.size as usize)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(out_of_range)?;
        buf.clear();
        buf.extend_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// Builds a [`SampleTable`]; samples are pushed in decode order.
pub struct SampleTableBuilder {
    timescale: NonZeroU32,
    width: u32,
    height: u32,
    duration: Option<i64>,
    parameter_sets: Vec<Bytes>,
    nal_length_size: u8,
    samples: Vec<Sample>,
    data: BytesMut,
}

impl SampleTableBuilder {
    pub fn parameter_set(mut self, nal: Bytes) -> Self {
        self.parameter_sets.push(nal);
        self
    }

    /// Sets the length prefix width of subsequently pushed samples. Defaults
    /// to 4.
    pub fn nal_length_size(self, nal_length_size: u8) -> Self {
        Self {
            nal_length_size,
            ..self
        }
    }

    /// Overrides the track duration, which otherwise is the latest end time
    /// of any sample.
    pub fn duration(self, duration: i64) -> Self {
        Self {
            duration: Some(duration),
            ..self
        }
    }

    /// Appends a sample whose payload is `data`, already in length-prefixed
    /// form.
    pub fn sample(
        mut self,
        composition_time: i64,
        time_delta: u32,
        is_sync: bool,
        data: &[u8],
    ) -> Self {
        let size = u32::try_from(data.len()).expect("sample payloads are under 4 GiB");
        self.samples.push(Sample {
            number: self.samples.len() as u64,
            composition_time,
            time_delta,
            nal_length_size: self.nal_length_size,
            is_sync,
            offset: self.data.len() as u64,
            size,
        });
        self.data.extend_from_slice(data);
        self
    }

    pub fn build(self) -> SampleTable {
        let duration = self.duration.unwrap_or_else(|| {
            self.samples
                .iter()
                .map(Sample::end_time)
                .max()
                .unwrap_or(0)
        });
        SampleTable {
            info: StreamInfo {
                duration,
                timescale: self.timescale,
                width: self.width,
                height: self.height,
                samples: self.samples.len() as u64,
                parameter_sets: self.parameter_sets,
            },
            samples: self.samples,
            data: self.data.freeze(),
            next: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    /// Sync samples at 0 and 30; 10 units per sample.
    fn table() -> SampleTable {
        let mut b = SampleTable::builder(NonZeroU32::new(100).unwrap(), 16, 16);
        for i in 0..6 {
            b = b.sample(i * 10, 10, i % 3 == 0, &[0, 0, 0, 1, i as u8]);
        }
        b.build()
    }

    #[test]
    fn builder() {
        let t = table();
        assert_eq!(t.info().duration, 60);
        assert_eq!(t.info().samples, 6);
        let s = &t.samples()[2];
        assert_eq!(s.number, 2);
        assert_eq!(s.offset, 10);
        assert_eq!(s.size, 5);
        assert!(s.contains(20) && s.contains(29) && !s.contains(30));
        assert_eq!(s.end_time(), 30);
    }

    #[test]
    fn reads_in_order() {
        let mut t = table();
        t.initialize().unwrap();
        let mut buf = Vec::new();
        for i in 0..6 {
            let s = t.next_sample().unwrap().unwrap();
            assert_eq!(s.number, i);
            t.read_payload(&s, &mut buf).unwrap();
            assert_eq!(buf, [0, 0, 0, 1, i as u8]);
        }
        assert!(t.next_sample().unwrap().is_none());
        assert!(t.next_sample().unwrap().is_none());
    }

    #[test]
    fn seek_to_sync_sample() {
        let mut t = table();
        t.initialize().unwrap();

        // Already at sample 0; no discontinuity.
        assert!(!t.seek(25, false).unwrap());
        assert_eq!(t.next_sample().unwrap().unwrap().number, 0);

        assert!(t.seek(45, false).unwrap());
        assert_eq!(t.next_sample().unwrap().unwrap().number, 3);

        // Backward.
        assert!(t.seek(0, false).unwrap());
        assert_eq!(t.next_sample().unwrap().unwrap().number, 0);

        // Clamped.
        assert!(t.seek(1_000, false).unwrap());
        assert_eq!(t.next_sample().unwrap().unwrap().number, 3);
        assert!(t.seek(-5, false).unwrap());
        assert_eq!(t.next_sample().unwrap().unwrap().number, 0);
    }

    #[test]
    fn exact_seek_out_of_range() {
        let mut t = table();
        assert!(matches!(
            t.seek(60, true),
            Err(SampleTableError::TargetOutOfRange {
                target: 60,
                duration: 60
            })
        ));
        assert!(t.seek(59, true).unwrap());
        assert_eq!(t.next_sample().unwrap().unwrap().number, 3);
    }

    #[test]
    fn no_sync_samples() {
        let mut t = SampleTable::builder(NonZeroU32::new(100).unwrap(), 16, 16)
            .sample(0, 10, false, &[0, 0, 0, 1, 0x41])
            .build();
        assert!(matches!(
            t.seek(0, false),
            Err(SampleTableError::NoSyncSample)
        ));
    }

    #[test]
    fn bad_payload_range() {
        let mut t = table();
        let mut s = t.samples()[5].clone();
        s.size = 6;
        let mut buf = Vec::new();
        let e = t.read_payload(&s, &mut buf).unwrap_err();
        assert!(matches!(
            e,
            SampleTableError::PayloadOutOfRange {
                number: 5,
                len: 30,
                ..
            }
        ));
    }
}
