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

use compact_str::CompactString;
use std::collections::{BTreeMap, VecDeque};

/// A single metadata frame: an ordered map of string pairs. Metadata
/// frames never carry end-of-stream.
pub type MetadataMap = BTreeMap<CompactString, CompactString>;

/// Per-filter FIFO of metadata frames deferred while the filter has
/// not completed its headers callback or has stopped iteration for
/// all frame types.
#[derive(Debug, Default)]
pub struct MetadataQueue {
    queue: VecDeque<MetadataMap>,
}

impl MetadataQueue {
    pub fn push(&mut self, metadata: MetadataMap) {
        self.queue.push_back(metadata);
    }

    /// Removes every queued frame, preserving insertion order.
    pub fn take_all(&mut self) -> VecDeque<MetadataMap> {
        std::mem::take(&mut self.queue)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
