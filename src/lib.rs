// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Frame-accurate H.264 decoding of MP4 video tracks.
//!
//! This crate sits between an MP4 demuxer (a [`SampleSource`]) and an H.264
//! picture decoder (a [`Decoder`]). It doesn't parse boxes or decode slices
//! itself. Instead it:
//!
//! *   rewrites each sample's AVC length-prefixed NAL units into the Annex B
//!     byte stream format most decoders expect (see [`reframe`]),
//! *   matches the decoder's reordered output back to the sample it came
//!     from, so each [`Picture`] has a composition time and duration,
//! *   seeks to an exact frame by restarting at the preceding sync sample and
//!     decoding forward,
//! *   drains pictures still buffered in the decoder at end of stream.
//!
//! ```no_run
//! # fn run<S: mp4decode::SampleSource, L: mp4decode::DecoderLibrary>(
//! #     source: S,
//! #     library: &L,
//! # ) -> Result<(), mp4decode::Error> {
//! let mut session = mp4decode::Session::open(source, library)?;
//! session.initialize()?;
//! session.seek_by_time(std::time::Duration::from_secs(4))?;
//! while let Some(picture) = session.read_next_frame()? {
//!     let (width, height) = (picture.width(), picture.height());
//!     println!("{width}x{height} at {:?}", session.current_composition_time());
//! }
//! session.close()
//! # }
//! ```

#![forbid(clippy::print_stderr, clippy::print_stdout)]

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

mod decoder;
mod error;
mod hex;
pub mod reframe;
mod session;
mod source;

#[doc(hidden)]
pub mod testutil;

pub use decoder::{
    DecodeOutput, Decoder, DecoderLibrary, DecoderStatus, Picture, PixelFormat, YuvImage,
};
pub use error::{Error, ErrorKind};
pub use session::{Session, SessionOptions};
pub use source::{
    Sample, SampleSource, SampleTable, SampleTableBuilder, SampleTableError, StreamInfo,
};
