// Copyright 2025 The vela Authors
//
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//

use super::buffer::BodyBuffer;
use bytes::Bytes;

/// A threshold crossing observed while mutating a [`WatermarkBuffer`].
///
/// The buffer reports crossings to its caller instead of invoking
/// stored callbacks; the filter manager routes the event to the
/// direction's flow-control policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WatermarkChange {
    AboveHigh,
    BelowLow,
}

/// Byte buffer with a high/low watermark pair.
///
/// The low watermark is half the high watermark. A high watermark of
/// zero disables threshold tracking entirely. Once the fill level
/// exceeds the high mark, `AboveHigh` is reported exactly once; the
/// matching `BelowLow` is reported when the level falls back to the
/// low mark or below.
#[derive(Debug, Default)]
pub struct WatermarkBuffer {
    inner: BodyBuffer,
    high_watermark: u32,
    above_high: bool,
}

impl WatermarkBuffer {
    pub fn new(high_watermark: u32) -> Self {
        WatermarkBuffer { inner: BodyBuffer::new(), high_watermark, above_high: false }
    }

    #[inline]
    pub fn high_watermark(&self) -> u32 {
        self.high_watermark
    }

    #[inline]
    pub fn low_watermark(&self) -> u32 {
        self.high_watermark / 2
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn add(&mut self, data: Bytes) -> Option<WatermarkChange> {
        self.inner.add(data);
        self.check_watermarks()
    }

    pub fn move_from(&mut self, other: &mut BodyBuffer) -> Option<WatermarkChange> {
        self.inner.move_from(other);
        self.check_watermarks()
    }

    /// Removes every byte, returning them as a plain [`BodyBuffer`]
    /// together with any low-watermark crossing the removal caused.
    pub fn take_all(&mut self) -> (BodyBuffer, Option<WatermarkChange>) {
        let out = std::mem::take(&mut self.inner);
        (out, self.check_watermarks())
    }

    /// Re-arms the thresholds; the new fill level is re-evaluated and
    /// may report a crossing in either direction.
    pub fn set_watermarks(&mut self, high_watermark: u32) -> Option<WatermarkChange> {
        self.high_watermark = high_watermark;
        self.check_watermarks()
    }

    fn check_watermarks(&mut self) -> Option<WatermarkChange> {
        if self.high_watermark == 0 {
            // Unbounded; a previously armed high notification is still
            // paired with a low one.
            if self.above_high {
                self.above_high = false;
                return Some(WatermarkChange::BelowLow);
            }
            return None;
        }
        let len = self.inner.len();
        if !self.above_high && len > self.high_watermark as usize {
            self.above_high = true;
            return Some(WatermarkChange::AboveHigh);
        }
        if self.above_high && len <= self.low_watermark() as usize {
            self.above_high = false;
            return Some(WatermarkChange::BelowLow);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_high_then_low() {
        let mut buffer = WatermarkBuffer::new(10);
        assert_eq!(buffer.add(Bytes::from_static(b"12345")), None);
        assert_eq!(buffer.add(Bytes::from_static(b"1234567890")), Some(WatermarkChange::AboveHigh));
        // Already above: no repeated notification.
        assert_eq!(buffer.add(Bytes::from_static(b"x")), None);
        let (data, change) = buffer.take_all();
        assert_eq!(data.len(), 16);
        assert_eq!(change, Some(WatermarkChange::BelowLow));
    }

    #[test]
    fn low_fires_at_half_of_high() {
        let mut buffer = WatermarkBuffer::new(10);
        assert_eq!(buffer.add(Bytes::from_static(b"123456789012")), Some(WatermarkChange::AboveHigh));
        // Draining to 6 bytes stays above the low mark of 5.
        buffer.inner.drain(6);
        assert_eq!(buffer.check_watermarks(), None);
        buffer.inner.drain(1);
        assert_eq!(buffer.check_watermarks(), Some(WatermarkChange::BelowLow));
    }

    #[test]
    fn zero_high_watermark_disables_tracking() {
        let mut buffer = WatermarkBuffer::new(0);
        assert_eq!(buffer.add(Bytes::from_static(b"very large body indeed")), None);
    }

    #[test]
    fn set_watermarks_reevaluates() {
        let mut buffer = WatermarkBuffer::new(100);
        assert_eq!(buffer.add(Bytes::from_static(b"0123456789")), None);
        assert_eq!(buffer.set_watermarks(4), Some(WatermarkChange::AboveHigh));
        assert_eq!(buffer.set_watermarks(100), Some(WatermarkChange::BelowLow));
    }

    #[test]
    fn disarming_watermarks_releases_high() {
        let mut buffer = WatermarkBuffer::new(4);
        assert_eq!(buffer.add(Bytes::from_static(b"12345")), Some(WatermarkChange::AboveHigh));
        assert_eq!(buffer.set_watermarks(0), Some(WatermarkChange::BelowLow));
    }
}
