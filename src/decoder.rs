// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The decoder side: what this crate needs from an H.264 decoder binding, and
//! the picture view it hands back to callers.

use std::num::NonZeroI32;

/// A nonzero status code returned by a native decoder call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecoderStatus(NonZeroI32);

impl DecoderStatus {
    /// Returns `None` for a zero (success) status.
    pub fn new(code: i32) -> Option<Self> {
        NonZeroI32::new(code).map(DecoderStatus)
    }

    pub fn code(self) -> i32 {
        self.0.get()
    }
}

impl std::fmt::Display for DecoderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What one [`Decoder::decode`] or [`Decoder::flush`] call produced.
///
/// A key and a status may come together: openh264, for example, reports an
/// error-concealed picture with a nonzero status.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeOutput {
    /// The key of the unit whose picture is now available through
    /// [`Decoder::picture`], or `None` if no picture is ready.
    pub key: Option<u64>,

    /// A nonzero status from the call, if any.
    pub status: Option<DecoderStatus>,
}

impl DecodeOutput {
    /// No picture and no error.
    pub fn pending() -> Self {
        Self::default()
    }

    /// The picture decoded from the unit tagged `key`.
    pub fn picture(key: u64) -> Self {
        DecodeOutput {
            key: Some(key),
            status: None,
        }
    }

    /// A failure with no picture.
    pub fn failed(status: DecoderStatus) -> Self {
        DecodeOutput {
            key: None,
            status: Some(status),
        }
    }

    pub fn with_status(self, status: Option<DecoderStatus>) -> Self {
        Self { status, ..self }
    }
}

impl From<Result<Option<u64>, DecoderStatus>> for DecodeOutput {
    fn from(r: Result<Option<u64>, DecoderStatus>) -> Self {
        match r {
            Ok(key) => DecodeOutput { key, status: None },
            Err(status) => DecodeOutput::failed(status),
        }
    }
}

/// An H.264 picture decoder, such as a binding to openh264.
///
/// Calls are synchronous and never run concurrently. Each unit passed to
/// [`Decoder::decode`] is in Annex B format and is tagged with a caller-chosen
/// key; when a picture comes out (possibly later, after reordering), the
/// decoder reports the key of the unit it was decoded from.
pub trait Decoder {
    /// Prepares a freshly created or uninitialized decoder for use.
    fn initialize(&mut self) -> Result<(), DecoderStatus>;

    /// Decodes one Annex B access unit.
    ///
    /// The output's key names the unit whose picture is now available, which
    /// may be an earlier unit than this one.
    fn decode(&mut self, unit: &[u8], key: u64) -> DecodeOutput;

    /// Emits one buffered picture without supplying more input.
    fn flush(&mut self) -> DecodeOutput;

    /// Tells the decoder no more input will follow, so every buffered picture
    /// may be flushed.
    fn signal_end_of_stream(&mut self) {}

    /// The number of pictures held back for reordering.
    fn remaining_buffered_frames(&self) -> usize;

    /// The most recently emitted picture, valid until the next `decode`,
    /// `flush`, or `uninitialize` call.
    fn picture(&self) -> Option<Picture<'_>>;

    fn uninitialize(&mut self);
}

/// Creates [`Decoder`]s; typically a handle to a loaded native library.
pub trait DecoderLibrary {
    type Decoder: Decoder;

    fn create_decoder(&self) -> Result<Self::Decoder, DecoderStatus>;
}

/// Layout of a [`Picture`]'s planes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar 4:2:0 YCbCr: full-resolution Y, then half-resolution Cb and Cr.
    I420,

    /// Some other decoder-specific format code.
    Other(u32),
}

/// A decoded picture whose planes are owned by the decoder.
///
/// The borrow ends at the next session call; use [`Picture::to_yuv_image`] to
/// keep the data longer.
#[derive(Copy, Clone)]
pub struct Picture<'a> {
    planes: [&'a [u8]; 3],
    strides: [usize; 3],
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl<'a> Picture<'a> {
    /// Wraps decoder-owned planes.
    ///
    /// # Panics
    ///
    /// For [`PixelFormat::I420`], panics if a plane is too short for its
    /// stride and the picture's dimensions.
    pub fn new(
        planes: [&'a [u8]; 3],
        strides: [usize; 3],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        let p = Picture {
            planes,
            strides,
            width,
            height,
            format,
        };
        if format == PixelFormat::I420 {
            for i in 0..3 {
                let (w, h) = p.plane_dimensions(i);
                let needed = match h {
                    0 => 0,
                    h => strides[i] * (h - 1) + w,
                };
                assert!(
                    strides[i] >= w && planes[i].len() >= needed,
                    "plane {i} of {width}x{height} I420 picture has stride {} and {} bytes",
                    strides[i],
                    planes[i].len(),
                );
            }
        }
        p
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Returns plane `i` (0 = Y, 1 = Cb, 2 = Cr).
    pub fn plane(&self, i: usize) -> &'a [u8] {
        self.planes[i]
    }

    pub fn stride(&self, i: usize) -> usize {
        self.strides[i]
    }

    pub fn y(&self) -> &'a [u8] {
        self.planes[0]
    }

    pub fn cb(&self) -> &'a [u8] {
        self.planes[1]
    }

    pub fn cr(&self) -> &'a [u8] {
        self.planes[2]
    }

    /// Returns the visible `(width, height)` of plane `i`, assuming I420.
    pub fn plane_dimensions(&self, i: usize) -> (usize, usize) {
        let (w, h) = (self.width as usize, self.height as usize);
        match i {
            0 => (w, h),
            _ => (w.div_ceil(2), h.div_ceil(2)),
        }
    }

    /// Copies the visible area of each plane into a tightly packed image.
    pub fn to_yuv_image(&self) -> YuvImage {
        let copy = |i: usize| {
            let (w, h) = self.plane_dimensions(i);
            let mut out = Vec::with_capacity(w * h);
            for row in 0..h {
                let start = row * self.strides[i];
                out.extend_from_slice(&self.planes[i][start..start + w]);
            }
            out
        };
        YuvImage {
            width: self.width,
            height: self.height,
            y: copy(0),
            cb: copy(1),
            cr: copy(2),
        }
    }
}

impl std::fmt::Debug for Picture<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("strides", &self.strides)
            .field("y", &crate::hex::LimitedHex::new(self.planes[0], 16))
            .finish()
    }
}

/// An owned, tightly packed I420 image copied out of a [`Picture`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct YuvImage {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub cb: Vec<u8>,
    pub cr: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status() {
        assert!(DecoderStatus::new(0).is_none());
        let s = DecoderStatus::new(16).unwrap();
        assert_eq!(s.code(), 16);
        assert_eq!(s.to_string(), "16");
    }

    #[test]
    fn output_from_result() {
        let s = DecoderStatus::new(4).unwrap();
        assert_eq!(DecodeOutput::from(Ok(None)), DecodeOutput::pending());
        assert_eq!(DecodeOutput::from(Ok(Some(7))), DecodeOutput::picture(7));
        assert_eq!(DecodeOutput::from(Err(s)), DecodeOutput::failed(s));
        let concealed = DecodeOutput::picture(7).with_status(Some(s));
        assert_eq!((concealed.key, concealed.status), (Some(7), Some(s)));
    }

    #[test]
    fn copy_out_drops_padding() {
        // 3x3 picture; chroma planes are 2x2. Stride padding is 0xff.
        let y = [1, 2, 3, 0xff, 4, 5, 6, 0xff, 7, 8, 9];
        let cb = [10, 11, 0xff, 12, 13];
        let cr = [20, 21, 0xff, 22, 23];
        let p = Picture::new([&y[..], &cb[..], &cr[..]], [4, 3, 3], 3, 3, PixelFormat::I420);
        assert_eq!(p.plane_dimensions(1), (2, 2));
        let img = p.to_yuv_image();
        assert_eq!(img.y, [1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(img.cb, [10, 11, 12, 13]);
        assert_eq!(img.cr, [20, 21, 22, 23]);
        assert_eq!((img.width, img.height), (3, 3));
    }

    #[test]
    #[should_panic]
    fn short_plane() {
        let y = [0u8; 5];
        let c = [0u8; 1];
        Picture::new([&y[..], &c[..], &c[..]], [2, 1, 1], 2, 3, PixelFormat::I420);
    }

    #[test]
    fn other_formats_unchecked() {
        let empty: &[u8] = &[];
        let p = Picture::new([empty; 3], [0, 0, 0], 16, 16, PixelFormat::Other(23));
        assert_eq!(p.format(), PixelFormat::Other(23));
    }
}
