// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps of NAL units for error messages and trace logging.

use pretty_hex::{HexConfig, PrettyHex};

/// Debug-formats at most `max_bytes` of `inner` as a hex dump, noting how
/// much was left out.
pub(crate) struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub(crate) fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = self.inner.len().min(self.max_bytes);
        let print = &self.inner[..shown];
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        let cfg = HexConfig {
            title: false,
            ..Default::default()
        };
        write!(f, "{:#?}", print.hex_conf(cfg))?;
        if shown < self.inner.len() {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", self.inner.len() - shown)?;
        }
        Ok(())
    }
}
