// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decode sessions: frame delivery, draining, and seeking.

use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, ErrorInt};
use crate::{
    DecodeOutput, Decoder, DecoderLibrary, DecoderStatus, Picture, PixelFormat, Sample,
    SampleSource, StreamInfo,
};
use crate::{hex::LimitedHex, reframe};

/// Key tagging the parameter-set unit, which shouldn't produce a picture.
/// Sample numbers never reach it.
const PARAMETER_SETS_KEY: u64 = u64::MAX;

/// Options for [`Session::open_with_options`].
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    exact_seek: bool,
    max_in_flight: Option<NonZeroUsize>,
}

impl SessionOptions {
    /// Passes `exact = true` to [`SampleSource::seek`], so the source may
    /// reject targets outside the stream rather than clamping them.
    ///
    /// Defaults to false.
    pub fn exact_seek(self, exact_seek: bool) -> Self {
        Self { exact_seek, ..self }
    }

    /// Logs a warning whenever more than this many submitted samples are
    /// awaiting output. A well-behaved decoder holds at most its reorder depth.
    pub fn max_in_flight(self, max_in_flight: Option<NonZeroUsize>) -> Self {
        Self {
            max_in_flight,
            ..self
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    /// Pulling samples from the source.
    Decoding,

    /// The source is exhausted; `remaining` flushes are left.
    Draining { remaining: usize },

    /// No more pictures until the next reset.
    Exhausted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Lifecycle {
    Opened,
    Initialized,

    /// Decoder initialization failed.
    Poisoned,
    Closed,
}

/// Result of a decoder call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Output {
    /// The decoder's picture is ready. [`DecodeSession::current`] describes
    /// it, if the decoder's key matched a sample.
    Picture,
    Pending,
}

fn closed() -> Error {
    wrap!(ErrorInt::FailedPrecondition("decoder is closed".to_owned()))
}

/// Decoder lifecycle and the correlation of its output with samples.
struct DecodeSession<D: Decoder> {
    /// `None` once closed.
    decoder: Option<D>,
    decoder_initialized: bool,

    /// Samples submitted to the decoder whose pictures haven't come out, by
    /// [`Sample::number`].
    in_flight: HashMap<u64, Sample>,

    phase: Phase,

    /// True iff the decoder's current picture is the result of a seek and
    /// hasn't been returned yet.
    held: bool,

    frame_number: Option<u64>,
    current: Option<Sample>,

    /// Nonzero status reported along with the current picture.
    current_status: Option<DecoderStatus>,
    max_in_flight: Option<NonZeroUsize>,
}

impl<D: Decoder> DecodeSession<D> {
    fn new(decoder: D, max_in_flight: Option<NonZeroUsize>) -> Self {
        DecodeSession {
            decoder: Some(decoder),
            decoder_initialized: false,
            in_flight: HashMap::new(),
            phase: Phase::Decoding,
            held: false,
            frame_number: None,
            current: None,
            current_status: None,
            max_in_flight,
        }
    }

    /// (Re)initializes the decoder and primes it with `parameter_sets`, an
    /// Annex B unit.
    fn initialize(&mut self, parameter_sets: &[u8]) -> Result<(), Error> {
        let decoder = self.decoder.as_mut().ok_or_else(closed)?;
        if self.decoder_initialized {
            decoder.uninitialize();
            self.decoder_initialized = false;
        }
        decoder
            .initialize()
            .map_err(|status| wrap!(ErrorInt::DecoderError {
                op: "initialize",
                status,
            }))?;
        self.decoder_initialized = true;
        if !parameter_sets.is_empty() {
            trace!(
                "priming decoder with parameter sets:\n{:?}",
                LimitedHex::new(parameter_sets, 128)
            );
            let out = decoder.decode(parameter_sets, PARAMETER_SETS_KEY);
            if let Some(key) = out.key {
                warn!("decoder emitted a picture (key {key}) for parameter sets");
            }
            if let Some(status) = out.status {
                bail!(ErrorInt::DecoderError {
                    op: "decode parameter sets",
                    status,
                });
            }
        }
        debug!("decoder initialized");
        Ok(())
    }

    /// Submits `sample`, whose payload is the Annex B `unit`.
    fn submit(&mut self, sample: Sample, unit: &[u8]) -> Result<Output, Error> {
        let decoder = self.decoder.as_mut().ok_or_else(closed)?;
        let number = sample.number;
        trace!(
            "submitting sample {number} (composition time {}, {} bytes)",
            sample.composition_time,
            unit.len()
        );

        // Insert first; the decoder may emit this very sample's picture.
        self.in_flight.insert(number, sample);
        let out = decoder.decode(unit, number);
        if out.key.is_none()
            && out.status.is_some()
            && self.in_flight.remove(&number).is_some()
        {
            debug!("dropping sample {number}, which failed to decode");
        }
        if let Some(max) = self.max_in_flight
            && self.in_flight.len() > max.get()
        {
            warn!(
                "{} samples in flight after submitting sample {number}; expected at most {max}",
                self.in_flight.len()
            );
        }
        self.take("decode", out)
    }

    /// Tells the decoder the source is exhausted and starts draining.
    fn end_of_stream(&mut self) -> Result<(), Error> {
        let decoder = self.decoder.as_mut().ok_or_else(closed)?;
        decoder.signal_end_of_stream();
        let remaining = decoder.remaining_buffered_frames();
        debug!(
            "end of stream; draining {remaining} buffered pictures with {} samples in flight",
            self.in_flight.len()
        );
        if remaining == 0 {
            self.exhaust();
        } else {
            self.phase = Phase::Draining { remaining };
        }
        Ok(())
    }

    /// Flushes one buffered picture.
    fn drain_next(&mut self) -> Result<Output, Error> {
        let Phase::Draining { remaining } = self.phase else {
            return Ok(Output::Pending);
        };
        let decoder = self.decoder.as_mut().ok_or_else(closed)?;
        let remaining = remaining - 1;
        self.phase = Phase::Draining { remaining };
        let out = decoder.flush();
        let r = self.take("flush", out);
        if remaining == 0 {
            self.exhaust();
        }
        r
    }

    /// Matches the output of decoder call `op` to an in-flight sample.
    ///
    /// A status without a picture is an error. A status with a picture is
    /// logged and kept in `current_status`.
    fn take(&mut self, op: &'static str, out: DecodeOutput) -> Result<Output, Error> {
        let Some(key) = out.key else {
            if let Some(status) = out.status {
                bail!(ErrorInt::DecoderError { op, status });
            }
            return Ok(Output::Pending);
        };
        if let Some(status) = out.status {
            warn!("decoder {op} returned a picture for key {key} with status {status}");
        }
        let sample = self.in_flight.remove(&key);
        match &sample {
            Some(s) => trace!("picture for sample {key} (composition time {})", s.composition_time),
            None => warn!("decoder emitted a picture for unknown key {key}"),
        }
        self.frame_number = match (self.frame_number, &sample) {
            (Some(n), _) => Some(n + 1),
            (None, Some(s)) => Some(s.number + 1),
            (None, None) => None,
        };
        self.current = sample;
        self.current_status = out.status;
        Ok(Output::Picture)
    }

    fn exhaust(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(
                "discarding {} in-flight samples that produced no picture",
                self.in_flight.len()
            );
            self.in_flight.clear();
        }
        self.phase = Phase::Exhausted;
    }

    /// Forgets all decode progress, discarding anything buffered in the
    /// decoder.
    fn reset(&mut self) {
        debug!("reset with {} samples in flight", self.in_flight.len());
        self.in_flight.clear();
        self.held = false;
        self.frame_number = None;
        self.current = None;
        self.current_status = None;
        self.phase = Phase::Decoding;
        if let Some(decoder) = self.decoder.as_mut()
            && self.decoder_initialized
        {
            for _ in 0..decoder.remaining_buffered_frames() {
                let out = decoder.flush();
                if out.key.is_none()
                    && let Some(status) = out.status
                {
                    warn!("ignoring flush failure with status {status} during reset");
                    break;
                }
            }
        }
    }

    /// True iff `t` lies within an in-flight sample that is still ahead of
    /// the current picture.
    fn in_flight_contains(&self, t: i64) -> bool {
        let after = self.current.as_ref().map_or(i64::MIN, Sample::end_time);
        self.in_flight
            .values()
            .any(|s| s.composition_time >= after && s.contains(t))
    }

    fn close(&mut self) {
        self.in_flight.clear();
        self.held = false;
        self.current = None;
        self.current_status = None;
        self.frame_number = None;
        self.phase = Phase::Exhausted;
        if let Some(mut decoder) = self.decoder.take() {
            if self.decoder_initialized {
                decoder.uninitialize();
                self.decoder_initialized = false;
            }
            debug!("decoder closed");
        }
    }
}

impl<D: Decoder> Drop for DecodeSession<D> {
    fn drop(&mut self) {
        self.close();
    }
}

fn source_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> Error {
    wrap!(ErrorInt::SourceError(Box::new(e)))
}

/// Decodes one video track, in presentation order, with frame-accurate
/// seeking.
///
/// Usage is `open`, then `initialize`, then any sequence of
/// [`Session::seek`] / [`Session::seek_by_time`] and
/// [`Session::read_next_frame`], then `close`. Every operation blocks the
/// calling thread on the source's I/O and the decoder's work.
pub struct Session<S: SampleSource, D: Decoder> {
    source: S,
    decode: DecodeSession<D>,
    lifecycle: Lifecycle,
    options: SessionOptions,

    /// Payload of the sample being submitted; reused between samples.
    payload: Vec<u8>,

    /// The stream's parameter sets as an Annex B unit.
    parameter_sets: Vec<u8>,
}

impl<S: SampleSource, D: Decoder> Session<S, D> {
    /// Creates a session with default options, and a decoder from `library`.
    pub fn open<L>(source: S, library: &L) -> Result<Self, Error>
    where
        L: DecoderLibrary<Decoder = D>,
    {
        Self::open_with_options(source, library, SessionOptions::default())
    }

    pub fn open_with_options<L>(
        source: S,
        library: &L,
        options: SessionOptions,
    ) -> Result<Self, Error>
    where
        L: DecoderLibrary<Decoder = D>,
    {
        let decoder = library
            .create_decoder()
            .map_err(|status| wrap!(ErrorInt::DecoderError { op: "create", status }))?;
        Ok(Session {
            source,
            decode: DecodeSession::new(decoder, options.max_in_flight),
            lifecycle: Lifecycle::Opened,
            options,
            payload: Vec::new(),
            parameter_sets: Vec::new(),
        })
    }

    /// Initializes the source, then initializes the decoder and primes it
    /// with the stream's parameter sets.
    ///
    /// Calling this again restarts from the beginning of the stream. A decoder
    /// failure leaves the session unusable.
    pub fn initialize(&mut self) -> Result<(), Error> {
        match self.lifecycle {
            Lifecycle::Opened => {}
            Lifecycle::Initialized => self.decode.reset(),
            Lifecycle::Poisoned => bail!(ErrorInt::FailedPrecondition(
                "decoder initialization previously failed".to_owned()
            )),
            Lifecycle::Closed => bail!(ErrorInt::FailedPrecondition(
                "session is closed".to_owned()
            )),
        }
        self.source.initialize().map_err(source_error)?;
        let info = self.source.info();
        debug!(
            "initializing: {}x{}, {} samples, duration {}/{}",
            info.width, info.height, info.samples, info.duration, info.timescale
        );
        self.parameter_sets = reframe::annex_b_parameter_sets(&info.parameter_sets)?;
        self.prime_decoder()?;
        self.lifecycle = Lifecycle::Initialized;
        Ok(())
    }

    fn prime_decoder(&mut self) -> Result<(), Error> {
        let r = self.decode.initialize(&self.parameter_sets);
        if r.is_err() {
            self.lifecycle = Lifecycle::Poisoned;
        }
        r
    }

    fn check_initialized(&self) -> Result<(), Error> {
        let msg = match self.lifecycle {
            Lifecycle::Initialized => return Ok(()),
            Lifecycle::Opened => "session isn't initialized",
            Lifecycle::Poisoned => "decoder initialization failed",
            Lifecycle::Closed => "session is closed",
        };
        bail!(ErrorInt::FailedPrecondition(msg.to_owned()))
    }

    fn info(&self) -> Result<&StreamInfo, Error> {
        match self.lifecycle {
            Lifecycle::Initialized | Lifecycle::Poisoned => Ok(self.source.info()),
            Lifecycle::Opened => bail!(ErrorInt::FailedPrecondition(
                "session isn't initialized".to_owned()
            )),
            Lifecycle::Closed => bail!(ErrorInt::FailedPrecondition(
                "session is closed".to_owned()
            )),
        }
    }

    /// Returns the next picture in presentation order, or `None` at the end
    /// of the stream.
    ///
    /// The picture borrows decoder-owned memory, so it must be dropped (or
    /// copied with [`Picture::to_yuv_image`]) before the next call. The
    /// `current_*` accessors describe it.
    ///
    /// An error from the source, the decoder, or reframing affects only this
    /// call; the next call moves on to the following sample. Once `None` is
    /// returned, later calls return `None` too until a seek.
    pub fn read_next_frame(&mut self) -> Result<Option<Picture<'_>>, Error> {
        self.check_initialized()?;
        if !self.advance()? {
            return Ok(None);
        }
        self.picture().map(Some)
    }

    /// Advances the decoder to its next picture, returning false at end of
    /// stream.
    fn advance(&mut self) -> Result<bool, Error> {
        if self.decode.held {
            self.decode.held = false;
            return Ok(true);
        }
        loop {
            let out = match self.decode.phase {
                Phase::Exhausted => return Ok(false),
                Phase::Draining { .. } => self.decode.drain_next()?,
                Phase::Decoding => {
                    let Some(sample) = self.source.next_sample().map_err(source_error)? else {
                        self.decode.end_of_stream()?;
                        continue;
                    };
                    self.source
                        .read_payload(&sample, &mut self.payload)
                        .map_err(source_error)?;
                    if self.payload.is_empty() {
                        trace!("skipping empty sample {}", sample.number);
                        continue;
                    }
                    reframe::to_annex_b(&mut self.payload, usize::from(sample.nal_length_size))?;
                    self.decode.submit(sample, &self.payload)?
                }
            };
            if out == Output::Picture {
                return Ok(true);
            }
        }
    }

    fn picture(&self) -> Result<Picture<'_>, Error> {
        let Some(picture) = self.decode.decoder.as_ref().and_then(|d| d.picture()) else {
            bail!(ErrorInt::FailedPrecondition(
                "decoder reported output without a picture".to_owned()
            ));
        };
        if picture.format() != PixelFormat::I420 {
            bail!(ErrorInt::UnsupportedPixelFormat(picture.format()));
        }
        Ok(picture)
    }

    /// Positions the session so the next [`Session::read_next_frame`]
    /// returns the picture displayed at `target` (in timescale units).
    ///
    /// If `target` lies within a sample already submitted to the decoder,
    /// decoding simply continues. Otherwise the source moves to the preceding
    /// sync sample and, if that's a discontinuity, the decoder restarts.
    /// Either way, pictures before `target` are decoded and skipped.
    ///
    /// If the stream ends before `target`, returns an error and the session
    /// stays at the end of the stream.
    pub fn seek(&mut self, target: i64) -> Result<(), Error> {
        self.check_initialized()?;
        if self.decode.in_flight_contains(target) {
            debug!("seek to {target}: already in flight");
        } else {
            let discontinuity = self
                .source
                .seek(target, self.options.exact_seek)
                .map_err(source_error)?;
            debug!(
                "seek to {target}: discontinuity={discontinuity} phase={:?}",
                self.decode.phase
            );
            if discontinuity || self.decode.phase != Phase::Decoding {
                self.decode.reset();
                self.prime_decoder()?;
            }
        }
        loop {
            if !self.advance()? {
                bail!(ErrorInt::FailedPrecondition(format!(
                    "seek target {target} is unreachable; stream ended first"
                )));
            }
            let Some(current) = &self.decode.current else {
                bail!(ErrorInt::FailedPrecondition(format!(
                    "seek to {target} found a picture with no matching sample"
                )));
            };
            if current.end_time() > target {
                debug!(
                    "seek to {target}: holding sample {} at {}",
                    current.number, current.composition_time
                );
                self.decode.held = true;
                return Ok(());
            }
            trace!(
                "seek to {target}: skipping sample {} at {}",
                current.number, current.composition_time
            );
        }
    }

    /// Seeks to a wall-clock offset from the start of the stream.
    ///
    /// `offset` is converted to timescale units with rounding. If rounding
    /// lands at or past the end of the stream, the last frame is used.
    pub fn seek_by_time(&mut self, offset: Duration) -> Result<(), Error> {
        let info = self.info()?;
        let duration = info.duration;
        let exact = offset.as_secs_f64() * f64::from(info.timescale.get());
        let mut target = exact.round() as i64;
        if exact < duration as f64 && target >= duration {
            target = duration - 1;
        }
        self.seek(target)
    }

    /// Returns the 1-based frame number of the last returned (or held)
    /// picture.
    ///
    /// After a restart it is seeded from the first matched sample's
    /// decode-order position, then counts pictures.
    pub fn current_frame_number(&self) -> Option<u64> {
        self.decode.frame_number
    }

    /// The nonzero status the decoder reported along with the last returned
    /// (or held) picture, such as for an error-concealed picture.
    pub fn current_decoder_status(&self) -> Option<DecoderStatus> {
        self.decode.current_status
    }

    /// The composition time of the last returned (or held) picture, if it
    /// matched a sample.
    pub fn current_composition_time(&self) -> Option<i64> {
        self.decode.current.as_ref().map(|s| s.composition_time)
    }

    pub fn current_time_delta(&self) -> Option<u32> {
        self.decode.current.as_ref().map(|s| s.time_delta)
    }

    /// Track duration, in timescale units.
    pub fn duration(&self) -> Result<i64, Error> {
        Ok(self.info()?.duration)
    }

    pub fn time_duration(&self) -> Result<Duration, Error> {
        let info = self.info()?;
        let nanos = i128::from(info.duration.max(0)) * 1_000_000_000
            / i128::from(info.timescale.get());
        Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    pub fn timescale(&self) -> Result<NonZeroU32, Error> {
        Ok(self.info()?.timescale)
    }

    /// Returns `(width, height)`.
    pub fn video_size(&self) -> Result<(u32, u32), Error> {
        let info = self.info()?;
        Ok((info.width, info.height))
    }

    pub fn sample_count(&self) -> Result<u64, Error> {
        Ok(self.info()?.samples)
    }

    /// Releases the decoder and closes the source. Idempotent.
    ///
    /// Afterward, every other operation fails.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Closed;
        self.decode.close();
        self.source.close().map_err(source_error)
    }
}
