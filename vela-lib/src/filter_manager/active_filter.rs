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

use super::route_cache::{ClusterInfo, Route, RouteConfiguration};
use super::FilterManager;
use crate::body::BodyBuffer;
use crate::filters::{
    DecoderFilter, DecoderFilterCallbacks, DownstreamWatermarkCallbacks, EncoderFilter, EncoderFilterCallbacks,
    FilterChainError,
};
use crate::metadata::{MetadataMap, MetadataQueue};
use crate::sink::{ConnectionInfo, Dispatcher};
use crate::stream_info::StreamInfo;
use crate::{RequestHead, ResponseHead};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use tracing::error;

/// Where a wrapper's iteration currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum IterationState {
    /// Frames flow through to the next filter.
    #[default]
    Continue,
    /// The current iteration stopped; later frame kinds still arrive.
    StopSingleIteration,
    /// Every frame kind is deferred; deferred body is buffered.
    StopAllBuffer,
    /// Every frame kind is deferred; overflow raises watermarks.
    StopAllWatermark,
}

/// State shared by both wrapper variants, composed rather than
/// inherited.
#[derive(Debug, Default)]
pub(crate) struct FilterBase {
    pub(crate) iteration_state: IterationState,
    /// Set while resuming out of StopAll so the next iteration
    /// includes this filter instead of starting after it.
    pub(crate) iterate_from_current_filter: bool,
    /// The headers callback returned `Continue`.
    pub(crate) headers_continued: bool,
    /// The headers callback has run, whatever it returned.
    pub(crate) headers_callback_called: bool,
    /// End-of-stream was delivered to this filter; it must never see
    /// another frame on this direction.
    pub(crate) end_stream: bool,
    pub(crate) saved_metadata: MetadataQueue,
}

impl FilterBase {
    #[inline]
    pub(crate) fn can_iterate(&self) -> bool {
        self.iteration_state == IterationState::Continue
    }

    #[inline]
    pub(crate) fn stopped_all(&self) -> bool {
        matches!(self.iteration_state, IterationState::StopAllBuffer | IterationState::StopAllWatermark)
    }

    #[inline]
    pub(crate) fn allow_iteration(&mut self) {
        self.iteration_state = IterationState::Continue;
    }
}

/// One decoder filter plus its wrapper state. The user filter is
/// taken out of its slot for the duration of a callback, which also
/// serves as the re-entry sentinel.
pub(crate) struct DecoderEntry {
    pub(crate) base: FilterBase,
    pub(crate) filter: Option<Box<dyn DecoderFilter>>,
}

impl DecoderEntry {
    pub(crate) fn new(filter: Box<dyn DecoderFilter>) -> Self {
        DecoderEntry { base: FilterBase::default(), filter: Some(filter) }
    }
}

/// One encoder filter plus its wrapper state.
pub(crate) struct EncoderEntry {
    pub(crate) base: FilterBase,
    /// The 1xx replay happened (or was observed) for this filter.
    pub(crate) continue_headers_continued: bool,
    pub(crate) filter: Option<Box<dyn EncoderFilter>>,
}

impl EncoderEntry {
    pub(crate) fn new(filter: Box<dyn EncoderFilter>) -> Self {
        EncoderEntry { base: FilterBase::default(), continue_headers_continued: false, filter: Some(filter) }
    }
}

/// Live handle for one decoder filter invocation: the manager plus
/// the position of the filter being called.
pub(crate) struct ActiveDecoderFilter<'a> {
    fm: &'a mut FilterManager,
    index: usize,
}

impl<'a> ActiveDecoderFilter<'a> {
    pub(crate) fn new(fm: &'a mut FilterManager, index: usize) -> Self {
        ActiveDecoderFilter { fm, index }
    }
}

impl DecoderFilterCallbacks for ActiveDecoderFilter<'_> {
    fn request_headers(&mut self) -> Option<&mut RequestHead> {
        self.fm.request_headers.as_mut()
    }

    fn request_trailers(&mut self) -> Option<&mut HeaderMap> {
        self.fm.request_trailers.as_mut()
    }

    fn add_decoded_data(&mut self, data: BodyBuffer, streaming: bool) -> Result<(), FilterChainError> {
        self.fm.add_decoded_data(self.index, data, streaming)
    }

    fn inject_decoded_data_to_filter_chain(&mut self, data: BodyBuffer, end_stream: bool) {
        self.fm.inject_decoded_data_to_filter_chain(self.index, data, end_stream);
    }

    fn add_decoded_trailers(&mut self) -> Result<&mut HeaderMap, FilterChainError> {
        self.fm.add_decoded_trailers()?;
        match self.fm.request_trailers.as_mut() {
            Some(trailers) => Ok(trailers),
            None => {
                error!("request trailers missing right after synthesis");
                Err(FilterChainError::TrailersOutsideLastDataFrame)
            },
        }
    }

    fn add_decoded_metadata(&mut self, metadata: MetadataMap) {
        self.fm.add_decoded_metadata(metadata);
    }

    fn continue_decoding(&mut self) {
        self.fm.common_continue_decoder(self.index);
    }

    fn encode_100_continue_headers(&mut self, headers: ResponseHead) {
        self.fm.encode_100_continue_headers(headers);
    }

    fn encode_headers(&mut self, headers: ResponseHead, end_stream: bool) {
        self.fm.encode_headers(headers, end_stream);
    }

    fn encode_data(&mut self, data: BodyBuffer, end_stream: bool) {
        self.fm.encode_data(data, end_stream);
    }

    fn encode_trailers(&mut self, trailers: HeaderMap) {
        self.fm.encode_trailers(trailers);
    }

    fn encode_metadata(&mut self, metadata: MetadataMap) {
        self.fm.encode_metadata(metadata);
    }

    fn send_local_reply(
        &mut self,
        code: StatusCode,
        body: &str,
        modify_headers: Option<Box<dyn FnOnce(&mut ResponseHead)>>,
        grpc_status: Option<u32>,
        details: &'static str,
    ) {
        self.fm.send_local_reply(code, body, modify_headers, grpc_status, details);
    }

    fn stream_info(&mut self) -> &mut StreamInfo {
        &mut self.fm.stream_info
    }

    fn connection(&self) -> Option<&ConnectionInfo> {
        self.fm.connection.as_ref()
    }

    fn dispatcher(&mut self) -> &mut dyn Dispatcher {
        &mut *self.fm.dispatcher
    }

    fn active_span(&self) -> &tracing::Span {
        &self.fm.span
    }

    fn route(&mut self) -> Option<Arc<Route>> {
        self.fm.route()
    }

    fn cluster_info(&mut self) -> Option<Arc<ClusterInfo>> {
        self.fm.cluster_info()
    }

    fn clear_route_cache(&mut self) {
        self.fm.clear_route_cache();
    }

    fn route_config(&mut self) -> Option<Arc<RouteConfiguration>> {
        self.fm.route_config()
    }

    fn request_route_config_update(&mut self, on_updated: Box<dyn FnOnce()>) {
        self.fm.request_route_config_update(on_updated);
    }

    fn decoder_buffer_limit(&self) -> u32 {
        self.fm.buffer_limit()
    }

    fn set_decoder_buffer_limit(&mut self, limit: u32) {
        self.fm.set_buffer_limit(limit);
    }

    fn add_downstream_watermark_callbacks(&mut self, callbacks: Arc<dyn DownstreamWatermarkCallbacks>) {
        self.fm.add_downstream_watermark_callbacks(callbacks);
    }

    fn remove_downstream_watermark_callbacks(&mut self, callbacks: &Arc<dyn DownstreamWatermarkCallbacks>) {
        self.fm.remove_downstream_watermark_callbacks(callbacks);
    }

    fn recreate_stream(&mut self) -> bool {
        self.fm.recreate_stream()
    }

    fn reset_stream(&mut self) {
        self.fm.reset_stream();
    }
}

/// Live handle for one encoder filter invocation.
pub(crate) struct ActiveEncoderFilter<'a> {
    fm: &'a mut FilterManager,
    index: usize,
}

impl<'a> ActiveEncoderFilter<'a> {
    pub(crate) fn new(fm: &'a mut FilterManager, index: usize) -> Self {
        ActiveEncoderFilter { fm, index }
    }
}

impl EncoderFilterCallbacks for ActiveEncoderFilter<'_> {
    fn response_headers(&mut self) -> Option<&mut ResponseHead> {
        self.fm.response_headers.as_mut()
    }

    fn response_trailers(&mut self) -> Option<&mut HeaderMap> {
        self.fm.response_trailers.as_mut()
    }

    fn continue_headers(&mut self) -> Option<&mut ResponseHead> {
        self.fm.continue_headers.as_mut()
    }

    fn add_encoded_data(&mut self, data: BodyBuffer, streaming: bool) -> Result<(), FilterChainError> {
        self.fm.add_encoded_data(self.index, data, streaming)
    }

    fn inject_encoded_data_to_filter_chain(&mut self, data: BodyBuffer, end_stream: bool) {
        self.fm.inject_encoded_data_to_filter_chain(self.index, data, end_stream);
    }

    fn add_encoded_trailers(&mut self) -> Result<&mut HeaderMap, FilterChainError> {
        self.fm.add_encoded_trailers()?;
        match self.fm.response_trailers.as_mut() {
            Some(trailers) => Ok(trailers),
            None => {
                error!("response trailers missing right after synthesis");
                Err(FilterChainError::TrailersOutsideLastDataFrame)
            },
        }
    }

    fn add_encoded_metadata(&mut self, metadata: MetadataMap) {
        self.fm.encode_metadata_from_filter(self.index, metadata);
    }

    fn continue_encoding(&mut self) {
        self.fm.common_continue_encoder(self.index);
    }

    fn stream_info(&mut self) -> &mut StreamInfo {
        &mut self.fm.stream_info
    }

    fn connection(&self) -> Option<&ConnectionInfo> {
        self.fm.connection.as_ref()
    }

    fn dispatcher(&mut self) -> &mut dyn Dispatcher {
        &mut *self.fm.dispatcher
    }

    fn active_span(&self) -> &tracing::Span {
        &self.fm.span
    }

    fn encoder_buffer_limit(&self) -> u32 {
        self.fm.buffer_limit()
    }

    fn set_encoder_buffer_limit(&mut self, limit: u32) {
        self.fm.set_buffer_limit(limit);
    }

    fn reset_stream(&mut self) {
        self.fm.reset_stream();
    }
}
