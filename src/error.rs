// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use bytes::Bytes;
use thiserror::Error;

use crate::{DecoderStatus, PixelFormat};

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages. [`Error::kind`] gives a
/// coarse classification for callers that need to branch on the failure.
///
/// Reaching the end of the stream is *not* an error; see
/// [`crate::Session::read_next_frame`].
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match *self.0 {
            ErrorInt::UnsupportedLengthSize(_)
            | ErrorInt::UnsupportedPixelFormat(_)
            | ErrorInt::InvalidParameterSet { .. } => ErrorKind::Configuration,
            ErrorInt::DecoderError { .. } => ErrorKind::Decoder,
            ErrorInt::SourceError(_) => ErrorKind::Source,
            ErrorInt::FailedPrecondition(_) => ErrorKind::State,
        }
    }

    /// Returns the native decoder status code, if this is a decoder error.
    pub fn decoder_status(&self) -> Option<DecoderStatus> {
        match *self.0 {
            ErrorInt::DecoderError { status, .. } => Some(status),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The stream uses something this crate doesn't support, such as a NAL
    /// length size other than 4 or a non-I420 picture.
    Configuration,

    /// The decoder returned a nonzero status.
    Decoder,

    /// The [`crate::SampleSource`] failed.
    Source,

    /// The operation isn't valid in the session's current state, or a seek
    /// target couldn't be reached.
    State,
}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    #[error("Unsupported NAL length size {0}; only 4-byte length prefixes are supported")]
    UnsupportedLengthSize(usize),

    #[error("Unsupported pixel format {0:?}; only I420 pictures are supported")]
    UnsupportedPixelFormat(PixelFormat),

    #[error(
        "Invalid parameter set #{index}: {description}\n{:?}",
        crate::hex::LimitedHex::new(data, 64)
    )]
    InvalidParameterSet {
        index: usize,
        description: String,
        data: Bytes,
    },

    #[error("Decoder {op} failed with status {status}")]
    DecoderError {
        op: &'static str,
        status: DecoderStatus,
    },

    #[error("Sample source error: {0}")]
    SourceError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let e = wrap!(ErrorInt::UnsupportedLengthSize(2));
        assert_eq!(e.kind(), ErrorKind::Configuration);
        assert!(e.decoder_status().is_none());

        let status = DecoderStatus::new(-3).unwrap();
        let e = wrap!(ErrorInt::DecoderError { op: "decode", status });
        assert_eq!(e.kind(), ErrorKind::Decoder);
        assert_eq!(e.decoder_status(), Some(status));
        assert_eq!(e.to_string(), "Decoder decode failed with status -3");

        let e = wrap!(ErrorInt::FailedPrecondition("session is closed".to_owned()));
        assert_eq!(e.kind(), ErrorKind::State);
    }

    #[test]
    fn source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let e = wrap!(ErrorInt::SourceError(Box::new(io)));
        assert_eq!(e.kind(), ErrorKind::Source);
        let source = std::error::Error::source(&e).unwrap();
        assert_eq!(source.to_string(), "short read");
    }

    #[test]
    fn invalid_parameter_set_shows_hex() {
        let e = wrap!(ErrorInt::InvalidParameterSet {
            index: 1,
            description: "unexpected NAL unit type".to_owned(),
            data: Bytes::from_static(b"\x65\x88\x84"),
        });
        let msg = e.to_string();
        assert!(msg.starts_with("Invalid parameter set #1: unexpected NAL unit type"));
        assert!(msg.contains("65 88 84"), "{msg}");
    }
}
