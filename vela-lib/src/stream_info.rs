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

use http::StatusCode;

bitflags::bitflags! {
    /// Why a stream ended the way it did. Collected on
    /// [`StreamInfo`] for the owning stream's observability layers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResponseFlags: u32 {
        const STREAM_IDLE_TIMEOUT = 0x01;
        const REQUEST_OVERALL_TIMEOUT = 0x02;
        const DURATION_TIMEOUT = 0x04;
        const REQUEST_PAYLOAD_TOO_LARGE = 0x08;
        const RESPONSE_PAYLOAD_TOO_LARGE = 0x10;
        const LOCAL_RESET = 0x20;
        const UPGRADE_FAILED = 0x40;
    }
}

/// Canonical response-code detail strings, one per termination cause.
pub mod response_code_details {
    pub const VIA_UPSTREAM: &str = "via_upstream";
    pub const STREAM_IDLE_TIMEOUT: &str = "stream_idle_timeout";
    pub const REQUEST_OVERALL_TIMEOUT: &str = "request_overall_timeout";
    pub const MAX_DURATION_TIMEOUT: &str = "max_duration_timeout";
    pub const REQUEST_PAYLOAD_TOO_LARGE: &str = "request_payload_too_large";
    pub const RESPONSE_PAYLOAD_TOO_LARGE: &str = "response_payload_too_large";
    pub const UPGRADE_FAILED: &str = "upgrade_failed";
}

/// Book-keeping for one stream, shared with the filters through the
/// wrapper callbacks.
#[derive(Debug, Default)]
pub struct StreamInfo {
    response_code: Option<StatusCode>,
    response_code_details: Option<&'static str>,
    response_flags: ResponseFlags,
    bytes_received: u64,
    last_downstream_rx_byte_received: bool,
    last_downstream_tx_byte_sent: bool,
}

impl StreamInfo {
    pub fn new() -> Self {
        StreamInfo::default()
    }

    #[inline]
    pub fn response_code(&self) -> Option<StatusCode> {
        self.response_code
    }

    pub fn set_response_code(&mut self, code: StatusCode) {
        self.response_code = Some(code);
    }

    #[inline]
    pub fn response_code_details(&self) -> Option<&'static str> {
        self.response_code_details
    }

    pub fn set_response_code_details(&mut self, details: &'static str) {
        self.response_code_details = Some(details);
    }

    #[inline]
    pub fn response_flags(&self) -> ResponseFlags {
        self.response_flags
    }

    pub fn add_response_flag(&mut self, flag: ResponseFlags) {
        self.response_flags |= flag;
    }

    #[inline]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn add_bytes_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
    }

    pub fn on_last_downstream_rx_byte_received(&mut self) {
        self.last_downstream_rx_byte_received = true;
    }

    #[inline]
    pub fn request_complete(&self) -> bool {
        self.last_downstream_rx_byte_received
    }

    pub fn on_last_downstream_tx_byte_sent(&mut self) {
        self.last_downstream_tx_byte_sent = true;
    }

    #[inline]
    pub fn response_complete(&self) -> bool {
        self.last_downstream_tx_byte_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accumulate() {
        let mut info = StreamInfo::new();
        info.add_response_flag(ResponseFlags::STREAM_IDLE_TIMEOUT);
        info.add_response_flag(ResponseFlags::LOCAL_RESET);
        assert!(info.response_flags().contains(ResponseFlags::STREAM_IDLE_TIMEOUT));
        assert!(info.response_flags().contains(ResponseFlags::LOCAL_RESET));
        assert!(!info.response_flags().contains(ResponseFlags::DURATION_TIMEOUT));
    }

    #[test]
    fn byte_and_completion_tracking() {
        let mut info = StreamInfo::new();
        assert_eq!(info.bytes_received(), 0);
        info.add_bytes_received(42);
        info.add_bytes_received(8);
        assert_eq!(info.bytes_received(), 50);

        assert!(!info.request_complete());
        info.on_last_downstream_rx_byte_received();
        assert!(info.request_complete());
    }
}
