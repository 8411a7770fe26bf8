// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversion from AVC length-prefixed framing (ISO/IEC 14496-15 section
//! 5.3.3, as stored in `.mp4` samples) to the Annex B byte stream format
//! (ISO/IEC 14496-10 Annex B) expected by most H.264 decoders.

use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};

use crate::error::{Error, ErrorInt};

/// The only supported NAL length size (`lengthSizeMinusOne + 1` in the
/// `AVCDecoderConfigurationRecord`).
///
/// A 4-byte length is exactly as wide as the `00 00 00 01` start code, which
/// is what lets [`to_annex_b`] work in place.
pub const SUPPORTED_LENGTH_SIZE: usize = 4;

const START_CODE: [u8; SUPPORTED_LENGTH_SIZE] = [0, 0, 0, 1];

/// Rewrites each big-endian length prefix in `buf` to a `00 00 00 01` start
/// code, in place.
///
/// The walk stops when fewer than `length_size` bytes remain or a length runs
/// past the end of `buf`; such a truncated tail is left as is. On error,
/// `buf` is unmodified.
pub fn to_annex_b(buf: &mut [u8], length_size: usize) -> Result<(), Error> {
    if length_size != SUPPORTED_LENGTH_SIZE {
        bail!(ErrorInt::UnsupportedLengthSize(length_size));
    }
    let mut pos = 0usize;
    while buf.len().saturating_sub(pos) >= SUPPORTED_LENGTH_SIZE {
        let prefix = &mut buf[pos..pos + SUPPORTED_LENGTH_SIZE];
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        prefix.copy_from_slice(&START_CODE);
        pos = match next_prefix(pos, len) {
            Some(p) => p,
            None => break,
        };
    }
    Ok(())
}

/// Returns the position of the prefix after a `len`-byte NAL unit whose prefix
/// starts at `pos`, or `None` if that isn't addressable.
fn next_prefix(pos: usize, len: u32) -> Option<usize> {
    let len = usize::try_from(len).ok()?;
    pos.checked_add(SUPPORTED_LENGTH_SIZE)?.checked_add(len)
}

/// Builds the Annex B unit used to prime a decoder: each parameter set
/// preceded by a start code.
///
/// Each set must be a sequence parameter set (or extension) or picture
/// parameter set NAL unit, including its header byte.
pub fn annex_b_parameter_sets(sets: &[Bytes]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(sets.iter().map(|s| START_CODE.len() + s.len()).sum());
    for (index, set) in sets.iter().enumerate() {
        let invalid = |description: String| {
            wrap!(ErrorInt::InvalidParameterSet {
                index,
                description,
                data: set.clone(),
            })
        };
        let header_byte = *set
            .first()
            .ok_or_else(|| invalid("empty NAL unit".to_owned()))?;
        let header =
            NalHeader::new(header_byte).map_err(|e| invalid(format!("bad NAL header: {e:?}")))?;
        match header.nal_unit_type() {
            UnitType::SeqParameterSet
            | UnitType::SeqParameterSetExtension
            | UnitType::PicParameterSet => {}
            o => return Err(invalid(format!("unexpected NAL unit type {o:?}"))),
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(set);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::ErrorKind;

    #[test]
    fn rewrites_prefixes() {
        let mut buf = [0, 0, 0, 2, 0, 1, 0, 0, 0, 3, 1, 1, 1];
        to_annex_b(&mut buf, 4).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 0, 1, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn large_lengths() {
        // A 0x0100-byte NAL followed by a 1-byte NAL. A length that's read
        // byte-by-byte without resetting between NALs would misplace the second
        // prefix.
        let mut buf = vec![0, 0, 1, 0];
        buf.extend(std::iter::repeat(0x41).take(0x100));
        buf.extend([0, 0, 0, 1, 0x09]);
        to_annex_b(&mut buf, 4).unwrap();
        assert_eq!(&buf[..4], &START_CODE);
        assert_eq!(&buf[4 + 0x100..4 + 0x100 + 4], &START_CODE);
        assert_eq!(buf[buf.len() - 1], 0x09);
        assert_eq!(buf.len(), 4 + 0x100 + 5);
    }

    #[test]
    fn unsupported_length_size_leaves_input() {
        for length_size in [0, 1, 2, 3, 8] {
            let orig = [0, 2, 0xaa, 0xbb, 0, 1, 0xcc];
            let mut buf = orig;
            let e = to_annex_b(&mut buf, length_size).unwrap_err();
            assert_eq!(e.kind(), ErrorKind::Configuration);
            assert_eq!(buf, orig);
        }
    }

    #[test]
    fn truncated_tail() {
        // Second prefix is cut short.
        let mut buf = [0, 0, 0, 1, 0x65, 0, 0, 7];
        to_annex_b(&mut buf, 4).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 0x65, 0, 0, 7]);

        // Length runs past the end.
        let mut buf = [0, 0, 0, 9, 0x65, 0x88];
        to_annex_b(&mut buf, 4).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 0x65, 0x88]);

        // Huge length doesn't overflow.
        let mut buf = [0xff, 0xff, 0xff, 0xff, 0x65];
        to_annex_b(&mut buf, 4).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 0x65]);
        let mut buf = [0, 0, 0, 1, 0x65, 0xff, 0xff, 0xff, 0xff, 0x41];
        to_annex_b(&mut buf, 4).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 0x65, 0, 0, 0, 1, 0x41]);

        let mut buf: [u8; 0] = [];
        to_annex_b(&mut buf, 4).unwrap();
    }

    #[test]
    fn next_prefix_overflow() {
        assert_eq!(next_prefix(0, 2), Some(6));
        assert_eq!(next_prefix(usize::MAX - 8, 4), Some(usize::MAX));
        assert_eq!(next_prefix(usize::MAX - 8, 5), None);
        assert_eq!(next_prefix(usize::MAX - 2, 0), None);
    }

    #[test]
    fn parameter_sets() {
        let sets = [
            Bytes::from_static(b"\x67\x64\x00\x1e\xac"),
            Bytes::from_static(b"\x68\xee\x3c\x80"),
        ];
        let blob = annex_b_parameter_sets(&sets).unwrap();
        assert_eq!(
            &blob[..],
            b"\x00\x00\x00\x01\x67\x64\x00\x1e\xac\x00\x00\x00\x01\x68\xee\x3c\x80"
        );
        assert!(annex_b_parameter_sets(&[]).unwrap().is_empty());
    }

    #[test]
    fn parameter_sets_rejects_slices() {
        let sets = [
            Bytes::from_static(b"\x67\x64\x00\x1e\xac"),
            Bytes::from_static(b"\x65\x88\x84"),
        ];
        let e = annex_b_parameter_sets(&sets).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Configuration);
        assert!(e.to_string().contains("#1"), "{e}");

        let e = annex_b_parameter_sets(&[Bytes::new()]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Configuration);

        // forbidden_zero_bit set.
        let e = annex_b_parameter_sets(&[Bytes::from_static(b"\xe7\x64")]).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Configuration);
    }
}
