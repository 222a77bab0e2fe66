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

use crate::body::BodyBuffer;
use crate::filter_manager::route_cache::Route;
use crate::filters::{DecoderFilter, EncoderFilter};
use crate::metadata::MetadataMap;
use crate::stream_info::StreamInfo;
use crate::RequestHead;
use crate::ResponseHead;
use compact_str::CompactString;
use http::HeaderMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Tracing custom tags refreshed together with the cached route.
pub type CustomTagMap = HashMap<CompactString, CompactString>;

/// Codec-facing consumer of completed frames, plus the stream-owner
/// hooks the chain needs (timers, flow control, stream lifecycle).
///
/// Every method has a no-op default so implementations only spell out
/// what they observe.
pub trait StreamSink {
    fn encode_filtered_100_continue_headers(&mut self, request_headers: &RequestHead, response_headers: &ResponseHead) {
        let _ = (request_headers, response_headers);
    }

    fn encode_filtered_headers(&mut self, response_headers: &ResponseHead, end_stream: bool) {
        let _ = (response_headers, end_stream);
    }

    fn encode_filtered_data(&mut self, data: BodyBuffer, end_stream: bool) {
        let _ = (data, end_stream);
    }

    fn encode_filtered_metadata(&mut self, metadata: Vec<MetadataMap>) {
        let _ = metadata;
    }

    fn encode_filtered_trailers(&mut self, trailers: &HeaderMap) {
        let _ = trailers;
    }

    /// The response direction observed end-of-stream. Fired at most
    /// once per stream.
    fn end_stream(&mut self) {}

    fn on_local_reset_stream(&mut self) {}

    fn decoder_above_write_buffer_high_watermark(&mut self) {}
    fn decoder_below_write_buffer_low_watermark(&mut self) {}

    fn request_too_large(&mut self) {}
    fn response_data_too_large(&mut self) {}

    fn on_upgrade(&mut self) {}
    fn on_idle_timeout(&mut self) {}
    fn on_request_timeout(&mut self) {}
    fn on_stream_max_duration_reached(&mut self) {}

    fn reset_idle_timer(&mut self) {}
    fn disarm_request_timeout(&mut self) {}
    fn cancel_timers(&mut self) {}

    /// Recreates the stream with the given request head. On failure
    /// the headers are handed back so the caller can restore
    /// ownership; `None` means the new stream was accepted.
    fn new_stream(&mut self, headers: RequestHead) -> Option<RequestHead> {
        Some(headers)
    }

    fn evaluate_route(&mut self, headers: &RequestHead, stream_info: &StreamInfo) -> Option<Arc<Route>> {
        let _ = (headers, stream_info);
        None
    }

    fn evaluate_custom_tags(&mut self, tags: &mut CustomTagMap) {
        let _ = tags;
    }
}

/// Ordered set of filters produced by a [`FilterChainFactory`] for
/// one stream.
#[derive(Default)]
pub struct FilterChainBuilder {
    pub(crate) decoder_filters: Vec<Box<dyn DecoderFilter>>,
    pub(crate) encoder_filters: Vec<Box<dyn EncoderFilter>>,
}

impl FilterChainBuilder {
    pub fn add_decoder_filter(&mut self, filter: Box<dyn DecoderFilter>) {
        self.decoder_filters.push(filter);
    }

    pub fn add_encoder_filter(&mut self, filter: Box<dyn EncoderFilter>) {
        self.encoder_filters.push(filter);
    }

    #[inline]
    pub fn decoder_filter_count(&self) -> usize {
        self.decoder_filters.len()
    }

    #[inline]
    pub fn encoder_filter_count(&self) -> usize {
        self.encoder_filters.len()
    }
}

impl std::fmt::Debug for FilterChainBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChainBuilder")
            .field("decoder_filters", &self.decoder_filters.len())
            .field("encoder_filters", &self.encoder_filters.len())
            .finish()
    }
}

/// Builds the per-stream filter chains.
pub trait FilterChainFactory {
    fn create_filter_chain(&self, chain: &mut FilterChainBuilder);

    /// Builds a chain for an upgrade request. `upgrade_map` comes
    /// from the matched route entry when one is cached. Returning
    /// `false` rejects the upgrade; the stream falls back to the
    /// default chain so a local reply can flow.
    fn create_upgrade_filter_chain(
        &self,
        upgrade: &str,
        upgrade_map: Option<&HashMap<CompactString, bool>>,
        chain: &mut FilterChainBuilder,
    ) -> bool {
        let _ = (upgrade, upgrade_map, chain);
        false
    }
}

/// The stream's event loop handle. Work arriving from another thread
/// must be posted here rather than touching stream state directly.
pub trait Dispatcher {
    fn post(&mut self, callback: Box<dyn FnOnce()>);
}

/// Runs posted work immediately on the calling thread. The default
/// dispatcher for embedders that drive the chain from their own
/// event loop.
#[derive(Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn post(&mut self, callback: Box<dyn FnOnce()>) {
        callback();
    }
}

/// Dynamic route configuration access for filters that steer RDS.
pub trait RouteConfigProvider {
    fn route_config(&self) -> Option<Arc<crate::filter_manager::route_cache::RouteConfiguration>>;
    fn request_update(&mut self, host: &str, on_updated: Box<dyn FnOnce()>);
}

/// Addresses of the downstream connection carrying this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub local_address: SocketAddr,
    pub peer_address: SocketAddr,
}

impl ConnectionInfo {
    pub fn new(local_address: SocketAddr, peer_address: SocketAddr) -> Self {
        ConnectionInfo { local_address, peer_address }
    }
}
