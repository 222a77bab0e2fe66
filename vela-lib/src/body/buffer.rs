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

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Segmented byte container used for body frames.
///
/// Bytes are held as a chain of [`Bytes`] segments so that
/// [`BodyBuffer::move_from`] transfers ownership of the backing
/// storage without copying.
#[derive(Debug, Default)]
pub struct BodyBuffer {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl BodyBuffer {
    pub fn new() -> Self {
        BodyBuffer::default()
    }

    /// Appends a segment to the end of the buffer.
    pub fn add(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    /// Steals every segment from `other`, leaving it empty.
    pub fn move_from(&mut self, other: &mut BodyBuffer) {
        self.len += other.len;
        other.len = 0;
        self.segments.append(&mut other.segments);
    }

    /// Removes up to `count` bytes from the front of the buffer.
    pub fn drain(&mut self, mut count: usize) {
        while count > 0 {
            let Some(mut front) = self.segments.pop_front() else {
                return;
            };
            if front.len() > count {
                self.len -= count;
                front.advance(count);
                self.segments.push_front(front);
                return;
            }
            self.len -= front.len();
            count -= front.len();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Linearizes the contents into a single [`Bytes`]. Cheap for the
    /// zero- and one-segment cases, a copy otherwise.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for segment in &self.segments {
                    out.extend_from_slice(segment);
                }
                out.freeze()
            },
        }
    }
}

impl From<Bytes> for BodyBuffer {
    fn from(data: Bytes) -> Self {
        let mut buffer = BodyBuffer::new();
        buffer.add(data);
        buffer
    }
}

impl From<&'static str> for BodyBuffer {
    fn from(data: &'static str) -> Self {
        Bytes::from_static(data.as_bytes()).into()
    }
}

impl From<Vec<u8>> for BodyBuffer {
    fn from(data: Vec<u8>) -> Self {
        Bytes::from(data).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_len() {
        let mut buffer = BodyBuffer::new();
        assert!(buffer.is_empty());
        buffer.add(Bytes::from_static(b"hello"));
        buffer.add(Bytes::from_static(b" world"));
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.to_bytes(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn empty_segments_are_dropped() {
        let mut buffer = BodyBuffer::new();
        buffer.add(Bytes::new());
        assert!(buffer.is_empty());
        assert_eq!(buffer.to_bytes(), Bytes::new());
    }

    #[test]
    fn move_from_transfers_ownership() {
        let mut a = BodyBuffer::from("abc");
        let mut b = BodyBuffer::from("def");
        a.move_from(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.len(), 6);
        assert_eq!(a.to_bytes(), Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn drain_across_segments() {
        let mut buffer = BodyBuffer::new();
        buffer.add(Bytes::from_static(b"abc"));
        buffer.add(Bytes::from_static(b"def"));
        buffer.drain(4);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.to_bytes(), Bytes::from_static(b"ef"));
        buffer.drain(10);
        assert!(buffer.is_empty());
    }
}
