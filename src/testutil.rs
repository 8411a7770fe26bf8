// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures for tests, benchmarks, and fuzzing. Unstable.
//!
//! [`synthetic_stream`] builds an H.264-shaped stream: real NAL headers
//! around ASCII bodies. Each slice's body is its composition time, which
//! lets [`ReorderingDecoder`] "decode" it: the decoder holds pictures back
//! like a real decoder with B-frame reordering, emits them in presentation
//! order, and renders planes that identify the frame.

use std::cell::RefCell;
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::rc::Rc;

use bytes::Bytes;

use crate::{
    DecodeOutput, Decoder, DecoderLibrary, DecoderStatus, Picture, PixelFormat, SampleTable,
};

pub const TIMESCALE: u32 = 30_000;
pub const FRAME_DELTA: u32 = 1_000;
pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

/// Extra bytes at the end of each plane row.
const PADDING: usize = 16;

pub const SPS: &[u8] = b"\x67\x42\xc0\x1esps";
pub const PPS: &[u8] = b"\x68\xcepps";

/// The unit isn't a sequence of Annex B NAL units with parseable slices.
pub const STATUS_BITSTREAM: i32 = 1;

/// A slice arrived before both parameter sets.
pub const STATUS_NO_PARAMETER_SETS: i32 = 2;

/// A non-IDR slice arrived before any IDR slice.
pub const STATUS_NO_REFERENCE: i32 = 4;

pub const STATUS_NOT_INITIALIZED: i32 = 8;

/// Requested via [`ReorderingLibrary::fail_keys`] or
/// [`ReorderingLibrary::fail_initialize_from`].
pub const STATUS_INJECTED: i32 = 16;

/// Reported along with pictures for [`ReorderingLibrary::conceal_keys`].
pub const STATUS_CONCEALED: i32 = 32;

#[cfg(test)]
pub(crate) fn init_logging() {
    use std::str::FromStr;
    let h = mylog::Builder::new()
        .set_format(
            ::std::env::var("MOONFIRE_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(::std::env::var("MOONFIRE_LOG").as_deref().unwrap_or("info"))
        .build();
    let _ = h.install();
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrameType {
    I,
    P,
    B,
}

/// Returns `(presentation index, type)` in decode order.
///
/// Each group of pictures starts with an IDR picture. The rest are coded in
/// runs of three presentation-order frames `a, a+1, a+2` sent as `P(a+2),
/// B(a), B(a+1)`; a leftover run of one or two is all P. Decoding this
/// needs a reorder depth of 2.
fn decode_order(frames: u32, gop: u32) -> Vec<(u32, FrameType)> {
    let mut out = Vec::with_capacity(frames as usize);
    let mut start = 0;
    while start < frames {
        let end = (start + gop).min(frames);
        out.push((start, FrameType::I));
        let mut a = start + 1;
        while a + 2 < end {
            out.push((a + 2, FrameType::P));
            out.push((a, FrameType::B));
            out.push((a + 1, FrameType::B));
            a += 3;
        }
        for p in a..end {
            out.push((p, FrameType::P));
        }
        start = end;
    }
    out
}

fn push_nal(out: &mut Vec<u8>, header: u8, body: &[u8]) {
    let len = u32::try_from(1 + body.len()).unwrap();
    out.extend_from_slice(&len.to_be_bytes());
    out.push(header);
    out.extend_from_slice(body);
}

/// Builds a `frames`-long 30 fps stream with an IDR picture every `gop`
/// frames. Sync samples also carry an SEI NAL unit.
pub fn synthetic_stream(frames: u32, gop: u32) -> SampleTable {
    let mut b = SampleTable::builder(NonZeroU32::new(TIMESCALE).unwrap(), WIDTH, HEIGHT)
        .parameter_set(Bytes::from_static(SPS))
        .parameter_set(Bytes::from_static(PPS));
    let mut payload = Vec::new();
    for (index, frame_type) in decode_order(frames, gop) {
        let composition_time = i64::from(index) * i64::from(FRAME_DELTA);
        let body = composition_time.to_string();
        payload.clear();
        let header = match frame_type {
            FrameType::I => {
                push_nal(&mut payload, 0x06, b"synthetic");
                0x65
            }
            FrameType::P => 0x41,
            FrameType::B => 0x01,
        };
        push_nal(&mut payload, header, body.as_bytes());
        b = b.sample(
            composition_time,
            FRAME_DELTA,
            frame_type == FrameType::I,
            &payload,
        );
    }
    b.build()
}

/// Recovers the frame index rendered into `p` by [`ReorderingDecoder`].
pub fn frame_index(p: &Picture<'_>) -> u32 {
    (u32::from(p.cb()[0]) << 8) | u32::from(p.cr()[0])
}

/// Call counts, shared between a [`ReorderingLibrary`] and its decoders.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub created: usize,
    pub initialize_calls: usize,
    pub uninitialized: usize,
    pub decoded: usize,
    pub flushed: usize,
}

/// Creates [`ReorderingDecoder`]s.
#[derive(Clone, Debug)]
pub struct ReorderingLibrary {
    /// Pictures held back before the oldest (in presentation order) is
    /// emitted.
    pub depth: usize,

    pub fail_create: bool,

    /// Fail the `n`th (0-based) and later `initialize` calls.
    pub fail_initialize_from: Option<usize>,

    /// Fail `decode` of units with these keys; their pictures are lost.
    pub fail_keys: HashSet<u64>,

    /// Emit pictures of units with these keys with [`STATUS_CONCEALED`].
    pub conceal_keys: HashSet<u64>,

    /// Report output keys that match no submitted unit.
    pub scramble_keys: bool,

    pub format: PixelFormat,

    stats: Rc<RefCell<DecoderStats>>,
}

impl ReorderingLibrary {
    pub fn new(depth: usize) -> Self {
        ReorderingLibrary {
            depth,
            fail_create: false,
            fail_initialize_from: None,
            fail_keys: HashSet::new(),
            conceal_keys: HashSet::new(),
            scramble_keys: false,
            format: PixelFormat::I420,
            stats: Rc::new(RefCell::new(DecoderStats::default())),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats.borrow().clone()
    }
}

impl DecoderLibrary for ReorderingLibrary {
    type Decoder = ReorderingDecoder;

    fn create_decoder(&self) -> Result<ReorderingDecoder, DecoderStatus> {
        if self.fail_create {
            return Err(status(STATUS_INJECTED));
        }
        self.stats.borrow_mut().created += 1;
        let plane_len = |w: usize, h: usize| (w + PADDING) * h;
        let (w, h) = (WIDTH as usize, HEIGHT as usize);
        Ok(ReorderingDecoder {
            config: self.clone(),
            initialized: false,
            has_sps: false,
            has_pps: false,
            has_idr: false,
            buffered: Vec::new(),
            planes: [
                vec![0; plane_len(w, h)],
                vec![0; plane_len(w.div_ceil(2), h.div_ceil(2))],
                vec![0; plane_len(w.div_ceil(2), h.div_ceil(2))],
            ],
            emitted: false,
        })
    }
}

fn status(code: i32) -> DecoderStatus {
    DecoderStatus::new(code).expect("status codes are nonzero")
}

/// A picture waiting in the reorder buffer.
#[derive(Debug)]
struct Buffered {
    key: u64,
    composition_time: i64,
}

#[derive(Debug)]
pub struct ReorderingDecoder {
    config: ReorderingLibrary,
    initialized: bool,
    has_sps: bool,
    has_pps: bool,
    has_idr: bool,
    buffered: Vec<Buffered>,
    planes: [Vec<u8>; 3],

    /// True iff `planes` hold an emitted picture.
    emitted: bool,
}

impl ReorderingDecoder {
    /// Splits an Annex B unit into NAL units.
    fn nals(unit: &[u8]) -> Result<Vec<&[u8]>, DecoderStatus> {
        const START: [u8; 4] = [0, 0, 0, 1];
        if !unit.starts_with(&START) {
            return Err(status(STATUS_BITSTREAM));
        }
        let mut nals = Vec::new();
        let mut rest = &unit[START.len()..];
        loop {
            let end = rest
                .windows(START.len())
                .position(|w| w == START)
                .unwrap_or(rest.len());
            if end == 0 {
                return Err(status(STATUS_BITSTREAM));
            }
            nals.push(&rest[..end]);
            if end == rest.len() {
                return Ok(nals);
            }
            rest = &rest[end + START.len()..];
        }
    }

    /// Moves the earliest buffered picture into `planes`.
    fn emit(&mut self) -> DecodeOutput {
        let Some(i) = self
            .buffered
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.composition_time)
            .map(|(i, _)| i)
        else {
            return DecodeOutput::pending();
        };
        let b = self.buffered.remove(i);
        let frame = u32::try_from(b.composition_time / i64::from(FRAME_DELTA)).unwrap_or(0);
        let (w, h) = (WIDTH as usize, HEIGHT as usize);
        let stride = w + PADDING;
        for row in 0..h {
            for x in 0..stride {
                self.planes[0][row * stride + x] = if x < w {
                    (x + row + frame as usize) as u8
                } else {
                    0xaa
                };
            }
        }
        self.planes[1].fill((frame >> 8) as u8);
        self.planes[2].fill(frame as u8);
        self.emitted = true;
        let out = DecodeOutput::picture(if self.config.scramble_keys {
            b.key + 1_000_000
        } else {
            b.key
        });
        if self.config.conceal_keys.contains(&b.key) {
            return out.with_status(Some(status(STATUS_CONCEALED)));
        }
        out
    }

    /// Parses `unit` and adds its picture, if any, to the reorder buffer.
    fn push(&mut self, unit: &[u8], key: u64) -> Result<(), DecoderStatus> {
        if !self.initialized {
            return Err(status(STATUS_NOT_INITIALIZED));
        }
        let mut picture = None;
        for nal in Self::nals(unit)? {
            match nal[0] & 0x1f {
                7 => self.has_sps = true,
                8 => self.has_pps = true,
                t @ (1 | 5) => {
                    if !(self.has_sps && self.has_pps) {
                        return Err(status(STATUS_NO_PARAMETER_SETS));
                    }
                    if t == 5 {
                        self.has_idr = true;
                    } else if !self.has_idr {
                        return Err(status(STATUS_NO_REFERENCE));
                    }
                    let composition_time = std::str::from_utf8(&nal[1..])
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| status(STATUS_BITSTREAM))?;
                    picture = Some(composition_time);
                }
                _ => {}
            }
        }
        if self.config.fail_keys.contains(&key) {
            return Err(status(STATUS_INJECTED));
        }
        if let Some(composition_time) = picture {
            self.buffered.push(Buffered {
                key,
                composition_time,
            });
        }
        Ok(())
    }
}

impl Decoder for ReorderingDecoder {
    fn initialize(&mut self) -> Result<(), DecoderStatus> {
        let call = {
            let mut stats = self.config.stats.borrow_mut();
            stats.initialize_calls += 1;
            stats.initialize_calls - 1
        };
        if matches!(self.config.fail_initialize_from, Some(n) if call >= n) {
            return Err(status(STATUS_INJECTED));
        }
        self.initialized = true;
        self.has_sps = false;
        self.has_pps = false;
        self.has_idr = false;
        self.buffered.clear();
        self.emitted = false;
        Ok(())
    }

    fn decode(&mut self, unit: &[u8], key: u64) -> DecodeOutput {
        self.config.stats.borrow_mut().decoded += 1;
        self.emitted = false;
        match self.push(unit, key) {
            Err(s) => DecodeOutput::failed(s),
            Ok(()) if self.buffered.len() > self.config.depth => self.emit(),
            Ok(()) => DecodeOutput::pending(),
        }
    }

    fn flush(&mut self) -> DecodeOutput {
        self.config.stats.borrow_mut().flushed += 1;
        self.emitted = false;
        if !self.initialized {
            return DecodeOutput::failed(status(STATUS_NOT_INITIALIZED));
        }
        self.emit()
    }

    fn remaining_buffered_frames(&self) -> usize {
        self.buffered.len()
    }

    fn picture(&self) -> Option<Picture<'_>> {
        if !self.emitted {
            return None;
        }
        let stride = WIDTH as usize + PADDING;
        let chroma_stride = (WIDTH as usize).div_ceil(2) + PADDING;
        Some(Picture::new(
            [&self.planes[0], &self.planes[1], &self.planes[2]],
            [stride, chroma_stride, chroma_stride],
            WIDTH,
            HEIGHT,
            self.config.format,
        ))
    }

    fn uninitialize(&mut self) {
        self.config.stats.borrow_mut().uninitialized += 1;
        self.initialized = false;
        self.buffered.clear();
        self.emitted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SampleSource, reframe};

    #[test]
    fn decode_order_needs_depth_two() {
        let order: Vec<u32> = decode_order(12, 6).into_iter().map(|(i, _)| i).collect();
        assert_eq!(order, [0, 3, 1, 2, 4, 5, 6, 9, 7, 8, 10, 11]);
    }

    #[test]
    fn reorders_to_presentation_order() {
        init_logging();
        let mut table = synthetic_stream(20, 10);
        let lib = ReorderingLibrary::new(2);
        let mut d = lib.create_decoder().unwrap();
        d.initialize().unwrap();
        let blob = reframe::annex_b_parameter_sets(&table.info().parameter_sets).unwrap();
        assert_eq!(d.decode(&blob, u64::MAX), DecodeOutput::pending());
        let mut buf = Vec::new();
        let mut out = Vec::new();
        while let Some(s) = table.next_sample().unwrap() {
            table.read_payload(&s, &mut buf).unwrap();
            reframe::to_annex_b(&mut buf, 4).unwrap();
            if d.decode(&buf, s.number).key.is_some() {
                out.push(frame_index(&d.picture().unwrap()));
            }
        }
        assert_eq!(d.remaining_buffered_frames(), 2);
        while d.flush().key.is_some() {
            out.push(frame_index(&d.picture().unwrap()));
        }
        assert_eq!(out, (0..20).collect::<Vec<_>>());
        assert_eq!(lib.stats().decoded, 21);
    }

    #[test]
    fn rejects_length_prefixed_input() {
        let lib = ReorderingLibrary::new(2);
        let mut d = lib.create_decoder().unwrap();
        d.initialize().unwrap();
        let out = d.decode(b"\x00\x00\x00\x05\x67sps", 0);
        assert_eq!(out, DecodeOutput::failed(status(STATUS_BITSTREAM)));
    }

    #[test]
    fn requires_parameter_sets_and_idr() {
        let lib = ReorderingLibrary::new(0);
        let mut d = lib.create_decoder().unwrap();
        d.initialize().unwrap();
        let out = d.decode(b"\x00\x00\x00\x01\x65\x30", 0);
        assert_eq!(out.status.unwrap().code(), STATUS_NO_PARAMETER_SETS);
        let out = d.decode(b"\x00\x00\x00\x01\x67sps\x00\x00\x00\x01\x68pps", 1);
        assert_eq!(out, DecodeOutput::pending());
        let out = d.decode(b"\x00\x00\x00\x01\x41\x31", 2);
        assert_eq!(out.status.unwrap().code(), STATUS_NO_REFERENCE);
        assert_eq!(
            d.decode(b"\x00\x00\x00\x01\x65\x30", 3),
            DecodeOutput::picture(3)
        );
    }

    #[test]
    fn concealed_picture_carries_status() {
        let mut lib = ReorderingLibrary::new(0);
        lib.conceal_keys = HashSet::from([1]);
        let mut d = lib.create_decoder().unwrap();
        d.initialize().unwrap();
        d.decode(b"\x00\x00\x00\x01\x67sps\x00\x00\x00\x01\x68pps", 0);
        assert_eq!(
            d.decode(b"\x00\x00\x00\x01\x65\x30", 1),
            DecodeOutput::picture(1).with_status(Some(status(STATUS_CONCEALED)))
        );
        assert!(d.picture().is_some());
    }
}
