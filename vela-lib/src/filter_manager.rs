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

pub mod active_filter;
pub mod local_reply;
pub mod route_cache;

#[cfg(test)]
mod tests;

use crate::body::{BodyBuffer, WatermarkBuffer, WatermarkChange};
use crate::filters::{
    DecoderFilter, DownstreamWatermarkCallbacks, EncoderFilter, FilterChainError, FilterDataStatus,
    FilterHeadersStatus, FilterTrailersStatus,
};
use crate::metadata::MetadataMap;
use crate::sink::{
    ConnectionInfo, CustomTagMap, Dispatcher, FilterChainBuilder, FilterChainFactory, InlineDispatcher,
    RouteConfigProvider, StreamSink,
};
use crate::stream_info::{response_code_details, ResponseFlags, StreamInfo};
use crate::{RequestHead, ResponseHead};
use active_filter::{ActiveDecoderFilter, ActiveEncoderFilter, DecoderEntry, EncoderEntry, IterationState};
use compact_str::CompactString;
use http::header::{CONTENT_TYPE, HOST, UPGRADE};
use http::{HeaderMap, Method, StatusCode};
use local_reply::{LocalReplyFormatter, LocalReplySpec, PlainTextFormatter};
use route_cache::{ClusterInfo, Route, RouteCache, RouteConfiguration};
use std::sync::Arc;
use tracing::{debug, error, trace};
use vela_configuration::HttpFilterChainConfig;

bitflags::bitflags! {
    /// Which filter callback is currently on the stack. At most one
    /// dispatch kind per direction is ever in flight; the bits
    /// enforce that and disambiguate the `add*Data` policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FilterCallState: u16 {
        const DECODE_HEADERS = 0x001;
        const DECODE_DATA = 0x002;
        const DECODE_TRAILERS = 0x004;
        const ENCODE_100_CONTINUE_HEADERS = 0x008;
        const ENCODE_HEADERS = 0x010;
        const ENCODE_DATA = 0x020;
        const ENCODE_TRAILERS = 0x040;
        /// The data frame being dispatched carries end-of-stream.
        /// Trailers may only be synthesized while this is set.
        const LAST_DATA_FRAME = 0x080;
    }
}

impl FilterCallState {
    const DECODING: FilterCallState =
        FilterCallState::DECODE_HEADERS.union(FilterCallState::DECODE_DATA).union(FilterCallState::DECODE_TRAILERS);
    const ENCODING: FilterCallState = FilterCallState::ENCODE_100_CONTINUE_HEADERS
        .union(FilterCallState::ENCODE_HEADERS)
        .union(FilterCallState::ENCODE_DATA)
        .union(FilterCallState::ENCODE_TRAILERS);
}

/// Where an iteration begins relative to the filter that handed the
/// frame back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterIterationStartState {
    /// Headers and 100-continue headers always resume after the
    /// originating filter.
    AlwaysStartFromNext,
    /// Data, trailers and metadata may resume at the originating
    /// filter itself when it stopped for all frame types.
    CanStartFromCurrent,
}

#[derive(Debug, Default)]
struct StreamState {
    filter_call_state: FilterCallState,
    /// The response direction has observed its end-of-stream.
    local_complete: bool,
    /// The request direction has observed its end-of-stream.
    remote_complete: bool,
    has_continue_headers: bool,
    created_filter_chain: bool,
    successful_upgrade: bool,
    decoding_headers_only: bool,
    encoding_headers_only: bool,
    destroyed: bool,
    is_head_request: bool,
    decoder_filters_streaming: bool,
    encoder_filters_streaming: bool,
    /// Guards the single end-of-stream signal toward the sink.
    encode_complete: bool,
}

struct PendingLocalReply {
    code: StatusCode,
    body: CompactString,
    modify_headers: Option<Box<dyn FnOnce(&mut ResponseHead)>>,
    grpc_status: Option<u32>,
    details: &'static str,
}

/// Drives the decoder and encoder filter chains over one HTTP
/// exchange: forwards frames through the ordered wrappers, accepts
/// continuations and injections back from them, and hands completed
/// frames to the codec-facing [`StreamSink`].
pub struct FilterManager {
    decoder_filters: Vec<DecoderEntry>,
    encoder_filters: Vec<EncoderEntry>,

    request_headers: Option<RequestHead>,
    request_trailers: Option<HeaderMap>,
    response_headers: Option<ResponseHead>,
    response_trailers: Option<HeaderMap>,
    continue_headers: Option<ResponseHead>,

    buffered_request_data: Option<WatermarkBuffer>,
    buffered_response_data: Option<WatermarkBuffer>,
    /// Wrapper through which the direction's bytes were first
    /// buffered; decides the too-large policy for that buffer.
    response_buffer_owner: Option<usize>,

    /// Metadata staged by `add_decoded_metadata` during a decode
    /// callback, dispatched once that callback returns.
    added_request_metadata: Vec<MetadataMap>,

    latest_data_decoding_filter: Option<usize>,
    latest_data_encoding_filter: Option<usize>,

    watermark_callbacks: Vec<Arc<dyn DownstreamWatermarkCallbacks>>,
    high_watermark_count: u32,
    buffer_limit: u32,
    proxy_100_continue: bool,

    state: StreamState,
    stream_info: StreamInfo,
    route_cache: RouteCache,
    tracing_custom_tags: Option<CustomTagMap>,
    pending_local_reply: Option<PendingLocalReply>,

    sink: Box<dyn StreamSink>,
    filter_chain_factory: Arc<dyn FilterChainFactory>,
    local_reply_formatter: Box<dyn LocalReplyFormatter>,
    dispatcher: Box<dyn Dispatcher>,
    route_config_provider: Option<Box<dyn RouteConfigProvider>>,
    connection: Option<ConnectionInfo>,
    span: tracing::Span,
}

impl std::fmt::Debug for FilterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterManager")
            .field("decoder_filters", &self.decoder_filters.len())
            .field("encoder_filters", &self.encoder_filters.len())
            .field("state", &self.state)
            .field("buffer_limit", &self.buffer_limit)
            .field("high_watermark_count", &self.high_watermark_count)
            .finish()
    }
}

pub struct FilterManagerBuilder {
    config: HttpFilterChainConfig,
    sink: Box<dyn StreamSink>,
    filter_chain_factory: Arc<dyn FilterChainFactory>,
    local_reply_formatter: Option<Box<dyn LocalReplyFormatter>>,
    dispatcher: Option<Box<dyn Dispatcher>>,
    route_config_provider: Option<Box<dyn RouteConfigProvider>>,
    connection: Option<ConnectionInfo>,
    span: Option<tracing::Span>,
}

impl FilterManagerBuilder {
    pub fn new(
        config: HttpFilterChainConfig,
        sink: Box<dyn StreamSink>,
        filter_chain_factory: Arc<dyn FilterChainFactory>,
    ) -> Self {
        FilterManagerBuilder {
            config,
            sink,
            filter_chain_factory,
            local_reply_formatter: None,
            dispatcher: None,
            route_config_provider: None,
            connection: None,
            span: None,
        }
    }

    pub fn with_local_reply_formatter(self, formatter: Box<dyn LocalReplyFormatter>) -> Self {
        FilterManagerBuilder { local_reply_formatter: Some(formatter), ..self }
    }

    pub fn with_dispatcher(self, dispatcher: Box<dyn Dispatcher>) -> Self {
        FilterManagerBuilder { dispatcher: Some(dispatcher), ..self }
    }

    pub fn with_route_config_provider(self, provider: Box<dyn RouteConfigProvider>) -> Self {
        FilterManagerBuilder { route_config_provider: Some(provider), ..self }
    }

    pub fn with_connection(self, connection: ConnectionInfo) -> Self {
        FilterManagerBuilder { connection: Some(connection), ..self }
    }

    pub fn with_span(self, span: tracing::Span) -> Self {
        FilterManagerBuilder { span: Some(span), ..self }
    }

    pub fn build(self) -> FilterManager {
        FilterManager {
            decoder_filters: Vec::new(),
            encoder_filters: Vec::new(),
            request_headers: None,
            request_trailers: None,
            response_headers: None,
            response_trailers: None,
            continue_headers: None,
            buffered_request_data: None,
            buffered_response_data: None,
            response_buffer_owner: None,
            added_request_metadata: Vec::new(),
            latest_data_decoding_filter: None,
            latest_data_encoding_filter: None,
            watermark_callbacks: Vec::new(),
            high_watermark_count: 0,
            buffer_limit: self.config.buffer_limit,
            proxy_100_continue: self.config.proxy_100_continue,
            state: StreamState {
                is_head_request: self.config.is_head_request,
                decoding_headers_only: self.config.decoding_headers_only,
                encoding_headers_only: self.config.encoding_headers_only,
                ..StreamState::default()
            },
            stream_info: StreamInfo::new(),
            route_cache: RouteCache::default(),
            tracing_custom_tags: None,
            pending_local_reply: None,
            sink: self.sink,
            filter_chain_factory: self.filter_chain_factory,
            local_reply_formatter: self.local_reply_formatter.unwrap_or_else(|| Box::new(PlainTextFormatter)),
            dispatcher: self.dispatcher.unwrap_or_else(|| Box::new(InlineDispatcher)),
            route_config_provider: self.route_config_provider,
            connection: self.connection,
            span: self.span.unwrap_or_else(tracing::Span::none),
        }
    }
}

/// Advances the per-direction marker of the farthest filter that has
/// received a data callback. The marker only moves while a fresh
/// forward sweep is in progress: it advances to `current` when the
/// previous filter was the latest one, so a restarted iteration
/// cannot hand the buffer back to an earlier filter once a later one
/// has inserted data.
fn record_latest_data_filter(current: usize, latest: &mut Option<usize>) {
    match *latest {
        None => *latest = Some(current),
        Some(marker) => {
            if current > 0 && marker == current - 1 {
                *latest = Some(current);
            }
        },
    }
}

impl FilterManager {
    pub fn builder(
        config: HttpFilterChainConfig,
        sink: Box<dyn StreamSink>,
        filter_chain_factory: Arc<dyn FilterChainFactory>,
    ) -> FilterManagerBuilder {
        FilterManagerBuilder::new(config, sink, filter_chain_factory)
    }

    #[inline]
    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    #[inline]
    pub fn stream_info_mut(&mut self) -> &mut StreamInfo {
        &mut self.stream_info
    }

    #[inline]
    pub fn destroyed(&self) -> bool {
        self.state.destroyed
    }

    #[inline]
    pub fn successful_upgrade(&self) -> bool {
        self.state.successful_upgrade
    }

    #[inline]
    pub fn high_watermark_count(&self) -> u32 {
        self.high_watermark_count
    }

    // ---------------------------------------------------------------
    // Filter chain creation
    // ---------------------------------------------------------------

    /// Builds the filter chains, once. Returns `false` when an
    /// upgrade request was rejected by the factory; the default chain
    /// is installed anyway so the caller's local reply can flow.
    pub fn create_filter_chain(&mut self) -> bool {
        if self.state.created_filter_chain {
            return false;
        }
        self.state.created_filter_chain = true;

        let upgrade = self
            .request_headers
            .as_ref()
            .and_then(|head| head.headers.get(UPGRADE))
            .and_then(|value| value.to_str().ok())
            .map(CompactString::from);

        if let Some(upgrade) = upgrade {
            // The cached route is consulted only when already
            // computed; chain creation may run before routing.
            let upgrade_map = self
                .route_cache
                .route()
                .and_then(|route| route.route_entry().map(|entry| entry.upgrade_map().clone()));
            let factory = Arc::clone(&self.filter_chain_factory);
            let mut chain = FilterChainBuilder::default();
            if factory.create_upgrade_filter_chain(&upgrade, upgrade_map.as_ref(), &mut chain) {
                self.install_filter_chain(chain);
                self.state.successful_upgrade = true;
                self.sink.on_upgrade();
                return true;
            }
            debug!(upgrade = %upgrade, "upgrade rejected, falling back to the default filter chain");
            let mut chain = FilterChainBuilder::default();
            factory.create_filter_chain(&mut chain);
            self.install_filter_chain(chain);
            return false;
        }

        let factory = Arc::clone(&self.filter_chain_factory);
        let mut chain = FilterChainBuilder::default();
        factory.create_filter_chain(&mut chain);
        self.install_filter_chain(chain);
        true
    }

    fn install_filter_chain(&mut self, chain: FilterChainBuilder) {
        self.decoder_filters = chain.decoder_filters.into_iter().map(DecoderEntry::new).collect();
        self.encoder_filters = chain.encoder_filters.into_iter().map(EncoderEntry::new).collect();
    }

    // ---------------------------------------------------------------
    // Stream-facing decode operations
    // ---------------------------------------------------------------

    pub fn decode_headers(&mut self, headers: RequestHead, end_stream: bool) {
        if self.state.destroyed {
            return;
        }
        self.maybe_end_decode(end_stream);
        if headers.method == Method::HEAD {
            self.state.is_head_request = true;
        }
        self.request_headers = Some(headers);
        if !self.state.created_filter_chain && !self.create_filter_chain() {
            self.stream_info.add_response_flag(ResponseFlags::UPGRADE_FAILED);
            self.send_local_reply(
                StatusCode::FORBIDDEN,
                "upgrade failed",
                None,
                None,
                response_code_details::UPGRADE_FAILED,
            );
            return;
        }
        self.dispatch_decode_headers(None, end_stream);
    }

    pub fn decode_data(&mut self, data: BodyBuffer, end_stream: bool) {
        if self.state.destroyed {
            return;
        }
        self.maybe_end_decode(end_stream);
        self.stream_info.add_bytes_received(data.len() as u64);
        self.dispatch_decode_data(None, data, end_stream, FilterIterationStartState::AlwaysStartFromNext);
    }

    pub fn decode_trailers(&mut self, trailers: HeaderMap) {
        if self.state.destroyed {
            return;
        }
        self.maybe_end_decode(true);
        debug_assert!(self.request_trailers.is_none());
        self.request_trailers = Some(trailers);
        self.dispatch_decode_trailers(None);
    }

    pub fn decode_metadata(&mut self, metadata: MetadataMap) {
        if self.state.destroyed {
            return;
        }
        self.dispatch_decode_metadata(None, metadata, FilterIterationStartState::CanStartFromCurrent);
    }

    /// External continuation entry for the decoder filter at
    /// `filter_index`, used when the resuming event does not hold a
    /// callbacks handle.
    pub fn continue_decoding(&mut self, filter_index: usize) {
        if filter_index >= self.decoder_filters.len() {
            error!(filter = filter_index, "continue_decoding on unknown filter");
            return;
        }
        self.common_continue_decoder(filter_index);
    }

    fn maybe_end_decode(&mut self, end_stream: bool) {
        debug_assert!(!self.state.remote_complete);
        self.state.remote_complete = end_stream;
        if end_stream {
            self.stream_info.on_last_downstream_rx_byte_received();
            debug!("request end stream");
        }
    }

    // ---------------------------------------------------------------
    // Stream-facing encode operations
    // ---------------------------------------------------------------

    pub fn encode_100_continue_headers(&mut self, headers: ResponseHead) {
        if self.state.destroyed {
            return;
        }
        // When not configured to proxy 1xx, swallow it here: the peer
        // may already have received a locally generated one.
        if !self.proxy_100_continue {
            return;
        }
        self.continue_headers = Some(headers);
        self.dispatch_encode_100_continue_headers(None);
        self.maybe_flush_pending_local_reply();
    }

    pub fn encode_headers(&mut self, headers: ResponseHead, end_stream: bool) {
        if self.state.destroyed {
            return;
        }
        self.stream_info.set_response_code(headers.status);
        if self.stream_info.response_code_details().is_none() {
            self.stream_info.set_response_code_details(response_code_details::VIA_UPSTREAM);
        }
        self.response_headers = Some(headers);
        self.dispatch_encode_headers(None, end_stream);
        self.maybe_flush_pending_local_reply();
    }

    pub fn encode_data(&mut self, data: BodyBuffer, end_stream: bool) {
        if self.state.destroyed {
            return;
        }
        self.dispatch_encode_data(None, data, end_stream, FilterIterationStartState::CanStartFromCurrent);
        self.maybe_flush_pending_local_reply();
    }

    pub fn encode_trailers(&mut self, trailers: HeaderMap) {
        if self.state.destroyed {
            return;
        }
        debug_assert!(self.response_trailers.is_none());
        self.response_trailers = Some(trailers);
        self.dispatch_encode_trailers(None);
        self.maybe_flush_pending_local_reply();
    }

    pub fn encode_metadata(&mut self, metadata: MetadataMap) {
        if self.state.destroyed {
            return;
        }
        self.dispatch_encode_metadata(None, metadata, FilterIterationStartState::CanStartFromCurrent);
        self.maybe_flush_pending_local_reply();
    }

    pub fn continue_encoding(&mut self, filter_index: usize) {
        if filter_index >= self.encoder_filters.len() {
            error!(filter = filter_index, "continue_encoding on unknown filter");
            return;
        }
        self.common_continue_encoder(filter_index);
        self.maybe_flush_pending_local_reply();
    }

    fn maybe_end_encode(&mut self, end_stream: bool) {
        if end_stream && !self.state.encode_complete {
            self.state.encode_complete = true;
            self.stream_info.on_last_downstream_tx_byte_sent();
            debug!("response end stream");
            self.sink.end_stream();
        }
    }

    // ---------------------------------------------------------------
    // Timeouts and termination
    // ---------------------------------------------------------------

    pub fn on_idle_timeout(&mut self) {
        if self.state.destroyed {
            return;
        }
        self.sink.on_idle_timeout();
        if self.response_headers.is_some() {
            // The response already started; all that is left is to
            // close it out.
            self.maybe_end_encode(true);
        } else {
            self.stream_info.add_response_flag(ResponseFlags::STREAM_IDLE_TIMEOUT);
            self.send_local_reply(
                StatusCode::REQUEST_TIMEOUT,
                "stream timeout",
                None,
                None,
                response_code_details::STREAM_IDLE_TIMEOUT,
            );
        }
    }

    pub fn on_request_timeout(&mut self) {
        if self.state.destroyed {
            return;
        }
        self.sink.on_request_timeout();
        self.stream_info.add_response_flag(ResponseFlags::REQUEST_OVERALL_TIMEOUT);
        self.send_local_reply(
            StatusCode::REQUEST_TIMEOUT,
            "request timeout",
            None,
            None,
            response_code_details::REQUEST_OVERALL_TIMEOUT,
        );
    }

    pub fn on_stream_max_duration_reached(&mut self) {
        if self.state.destroyed {
            return;
        }
        debug!("stream max duration reached");
        self.stream_info.add_response_flag(ResponseFlags::DURATION_TIMEOUT);
        self.stream_info.set_response_code_details(response_code_details::MAX_DURATION_TIMEOUT);
        self.sink.on_stream_max_duration_reached();
        self.maybe_end_encode(true);
    }

    /// Tears the stream down. Every later `decode*`/`encode*` entry
    /// becomes a no-op.
    pub fn reset_stream(&mut self) {
        if self.state.destroyed {
            return;
        }
        debug!("resetting stream");
        self.state.destroyed = true;
        self.stream_info.add_response_flag(ResponseFlags::LOCAL_RESET);
        self.sink.cancel_timers();
        self.sink.on_local_reset_stream();
        self.destroy_filters();
    }

    /// Orderly teardown after both directions completed.
    pub fn on_destroy(&mut self) {
        if self.state.destroyed {
            return;
        }
        self.state.destroyed = true;
        self.sink.cancel_timers();
        self.destroy_filters();
    }

    fn destroy_filters(&mut self) {
        for entry in &mut self.decoder_filters {
            if let Some(filter) = entry.filter.as_mut() {
                filter.on_destroy();
            }
        }
        for entry in &mut self.encoder_filters {
            if let Some(filter) = entry.filter.as_mut() {
                filter.on_destroy();
            }
        }
        // Every outstanding high-watermark notification is paired
        // with a low one before the registrants go away.
        while self.high_watermark_count > 0 {
            self.call_low_watermark_callbacks();
        }
    }

    // ---------------------------------------------------------------
    // Local reply
    // ---------------------------------------------------------------

    pub fn send_local_reply(
        &mut self,
        code: StatusCode,
        body: &str,
        modify_headers: Option<Box<dyn FnOnce(&mut ResponseHead)>>,
        grpc_status: Option<u32>,
        details: &'static str,
    ) {
        if self.state.destroyed {
            return;
        }
        if self.state.filter_call_state.intersects(FilterCallState::ENCODING) {
            // An encoder callback is on the stack; replying from here
            // would re-enter the encode path. Queue the reply until
            // the dispatch unwinds.
            debug!(code = %code, "queueing local reply behind in-flight encoder callback");
            self.pending_local_reply = Some(PendingLocalReply {
                code,
                body: CompactString::from(body),
                modify_headers,
                grpc_status,
                details,
            });
            return;
        }
        self.send_local_reply_now(code, body, modify_headers, grpc_status, details);
    }

    fn send_local_reply_now(
        &mut self,
        code: StatusCode,
        body: &str,
        modify_headers: Option<Box<dyn FnOnce(&mut ResponseHead)>>,
        grpc_status: Option<u32>,
        details: &'static str,
    ) {
        debug!(code = %code, details, "sending local reply");
        self.stream_info.set_response_code(code);
        self.stream_info.set_response_code_details(details);

        if self.response_headers.is_some() {
            // The response is already in flight; a second head cannot
            // be sent, so the stream is torn down instead.
            debug!("resetting stream: local reply after response headers were sent");
            self.reset_stream();
            return;
        }

        // The reply flows through the encoder filters like any other
        // response, so a chain must exist.
        if !self.state.created_filter_chain {
            let _ = self.create_filter_chain();
        }

        let spec = LocalReplySpec {
            code,
            body,
            grpc_status,
            details,
            is_head_request: self.state.is_head_request,
            is_grpc_request: self.is_grpc_request(),
        };
        let (mut head, body_buffer) = self.local_reply_formatter.format(&spec);
        if let Some(modify) = modify_headers {
            modify(&mut head);
        }
        let has_body = !body_buffer.is_empty();
        self.response_headers = Some(head);
        self.dispatch_encode_headers(None, !has_body);
        if self.state.destroyed {
            return;
        }
        if has_body {
            self.dispatch_encode_data(None, body_buffer, true, FilterIterationStartState::CanStartFromCurrent);
        }
    }

    fn maybe_flush_pending_local_reply(&mut self) {
        if !self.state.filter_call_state.is_empty() {
            return;
        }
        if let Some(pending) = self.pending_local_reply.take() {
            debug!("dispatching deferred local reply");
            self.send_local_reply_now(
                pending.code,
                &pending.body,
                pending.modify_headers,
                pending.grpc_status,
                pending.details,
            );
        }
    }

    fn is_grpc_request(&self) -> bool {
        self.request_headers
            .as_ref()
            .and_then(|head| head.headers.get(CONTENT_TYPE))
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/grpc"))
    }

    // ---------------------------------------------------------------
    // Buffer limits and watermarks
    // ---------------------------------------------------------------

    pub fn set_buffer_limit(&mut self, limit: u32) {
        debug!(limit, "setting buffer limit");
        self.buffer_limit = limit;
        let change = self.buffered_request_data.as_mut().and_then(|buffer| buffer.set_watermarks(limit));
        if let Some(change) = change {
            self.on_decoder_buffer_change(change);
        }
        let change = self.buffered_response_data.as_mut().and_then(|buffer| buffer.set_watermarks(limit));
        if let Some(change) = change {
            let owner = self.response_buffer_owner.unwrap_or(0);
            self.on_encoder_buffer_change(change, owner);
        }
    }

    #[inline]
    pub fn buffer_limit(&self) -> u32 {
        self.buffer_limit
    }

    fn on_decoder_buffer_change(&mut self, change: WatermarkChange) {
        match change {
            WatermarkChange::AboveHigh => self.request_data_too_large(),
            WatermarkChange::BelowLow => self.request_data_drained(),
        }
    }

    fn on_encoder_buffer_change(&mut self, change: WatermarkChange, owner: usize) {
        match change {
            WatermarkChange::AboveHigh => self.response_data_too_large(owner),
            WatermarkChange::BelowLow => self.response_data_drained(),
        }
    }

    fn request_data_too_large(&mut self) {
        debug!("request data too large watermark exceeded");
        if self.state.decoder_filters_streaming {
            debug!("read-disabling downstream stream due to filter callbacks");
            self.sink.decoder_above_write_buffer_high_watermark();
        } else {
            self.sink.request_too_large();
            self.stream_info.add_response_flag(ResponseFlags::REQUEST_PAYLOAD_TOO_LARGE);
            self.send_local_reply(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload too large",
                None,
                None,
                response_code_details::REQUEST_PAYLOAD_TOO_LARGE,
            );
        }
    }

    fn request_data_drained(&mut self) {
        debug!("read-enabling downstream stream due to filter callbacks");
        self.sink.decoder_below_write_buffer_low_watermark();
    }

    fn response_data_too_large(&mut self, owner: usize) {
        if self.state.encoder_filters_streaming {
            debug!("disabling upstream stream due to filter callbacks");
            self.call_high_watermark_callbacks();
            return;
        }
        self.sink.response_data_too_large();
        self.stream_info.add_response_flag(ResponseFlags::RESPONSE_PAYLOAD_TOO_LARGE);
        if !self.encoder_filters[owner].base.headers_continued {
            // Headers have not reached the sink yet: replace the
            // overlarge response with a 500, emitted directly so the
            // chain does not see a second set of response headers.
            // Streaming mode avoids nested watermark calls from the
            // body buffer while this unwinds.
            self.state.encoder_filters_streaming = true;
            self.encoder_filters[owner].base.allow_iteration();
            self.send_direct_local_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
                response_code_details::RESPONSE_PAYLOAD_TOO_LARGE,
            );
        } else {
            debug!("resetting stream: response data too large and headers have already been sent");
            self.reset_stream();
        }
    }

    fn response_data_drained(&mut self) {
        debug!("enabling upstream stream due to filter callbacks");
        self.call_low_watermark_callbacks();
    }

    /// Emits a synthesized response straight to the sink, bypassing
    /// the encoder chain.
    fn send_direct_local_reply(&mut self, code: StatusCode, body: &str, details: &'static str) {
        self.stream_info.set_response_code(code);
        self.stream_info.set_response_code_details(details);
        let spec = LocalReplySpec {
            code,
            body,
            grpc_status: None,
            details,
            is_head_request: self.state.is_head_request,
            is_grpc_request: self.is_grpc_request(),
        };
        let (head, body_buffer) = self.local_reply_formatter.format(&spec);
        let has_body = !body_buffer.is_empty();
        self.response_headers = Some(head);
        let (sink, headers) = (&mut self.sink, &self.response_headers);
        if let Some(headers) = headers.as_ref() {
            sink.encode_filtered_headers(headers, !has_body);
        }
        self.maybe_end_encode(!has_body);
        if has_body {
            self.sink.encode_filtered_data(body_buffer, true);
            self.maybe_end_encode(true);
        }
        self.state.local_complete = true;
    }

    fn call_high_watermark_callbacks(&mut self) {
        self.high_watermark_count += 1;
        for callbacks in &self.watermark_callbacks {
            callbacks.on_above_write_buffer_high_watermark();
        }
    }

    fn call_low_watermark_callbacks(&mut self) {
        debug_assert!(self.high_watermark_count > 0);
        self.high_watermark_count = self.high_watermark_count.saturating_sub(1);
        for callbacks in &self.watermark_callbacks {
            callbacks.on_below_write_buffer_low_watermark();
        }
    }

    pub(crate) fn add_downstream_watermark_callbacks(&mut self, callbacks: Arc<dyn DownstreamWatermarkCallbacks>) {
        debug_assert!(!self.watermark_callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callbacks)));
        // A late registrant catches up on the notifications it
        // missed.
        for _ in 0..self.high_watermark_count {
            callbacks.on_above_write_buffer_high_watermark();
        }
        self.watermark_callbacks.push(callbacks);
    }

    pub(crate) fn remove_downstream_watermark_callbacks(&mut self, callbacks: &Arc<dyn DownstreamWatermarkCallbacks>) {
        debug_assert!(self.watermark_callbacks.iter().any(|existing| Arc::ptr_eq(existing, callbacks)));
        self.watermark_callbacks.retain(|existing| !Arc::ptr_eq(existing, callbacks));
    }

    // ---------------------------------------------------------------
    // Route cache
    // ---------------------------------------------------------------

    pub(crate) fn route(&mut self) -> Option<Arc<Route>> {
        if !self.route_cache.is_computed() {
            self.refresh_cached_route();
        }
        self.route_cache.route()
    }

    pub(crate) fn cluster_info(&mut self) -> Option<Arc<ClusterInfo>> {
        // Refreshing the route refreshes the cluster as well.
        if !self.route_cache.is_computed() {
            self.refresh_cached_route();
        }
        self.route_cache.cluster_info()
    }

    pub(crate) fn clear_route_cache(&mut self) {
        self.route_cache.clear();
        if let Some(tags) = self.tracing_custom_tags.as_mut() {
            tags.clear();
        }
    }

    fn refresh_cached_route(&mut self) {
        let route = {
            let (sink, headers, stream_info) = (&mut self.sink, &self.request_headers, &self.stream_info);
            match headers.as_ref() {
                Some(headers) => sink.evaluate_route(headers, stream_info),
                None => None,
            }
        };
        let cluster_info =
            route.as_ref().and_then(|route| route.route_entry().map(|entry| Arc::clone(entry.cluster())));
        self.route_cache.set(route, cluster_info);
        self.refresh_cached_tracing_custom_tags();
    }

    fn refresh_cached_tracing_custom_tags(&mut self) {
        let tags = self.tracing_custom_tags.get_or_insert_with(CustomTagMap::new);
        self.sink.evaluate_custom_tags(tags);
    }

    pub(crate) fn route_config(&mut self) -> Option<Arc<RouteConfiguration>> {
        self.route_config_provider.as_ref().and_then(|provider| provider.route_config())
    }

    pub(crate) fn request_route_config_update(&mut self, on_updated: Box<dyn FnOnce()>) {
        let host = self.request_headers.as_ref().and_then(|head| {
            head.headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_ascii_lowercase)
                .or_else(|| head.uri.authority().map(|authority| authority.as_str().to_ascii_lowercase()))
        });
        match (self.route_config_provider.as_mut(), host) {
            (Some(provider), Some(host)) => provider.request_update(&host, on_updated),
            _ => debug!("route config update requested without provider or host"),
        }
    }

    pub(crate) fn recreate_stream(&mut self) -> bool {
        // The filter's and the stream's view of completeness can
        // disagree; re-check received bytes so a request with a body
        // is never replayed.
        if !self.state.remote_complete || self.stream_info.bytes_received() != 0 {
            return false;
        }
        let Some(headers) = self.request_headers.take() else {
            return false;
        };
        match self.sink.new_stream(headers) {
            Some(returned) => {
                // Rejected: take ownership back and carry on.
                self.request_headers = Some(returned);
                false
            },
            None => true,
        }
    }

    // ---------------------------------------------------------------
    // Per-filter frame additions
    // ---------------------------------------------------------------

    pub(crate) fn add_decoded_data(
        &mut self,
        index: usize,
        mut data: BodyBuffer,
        streaming: bool,
    ) -> Result<(), FilterChainError> {
        let call_state = self.state.filter_call_state;
        let buffering = call_state.is_empty()
            || call_state.intersects(FilterCallState::DECODE_HEADERS | FilterCallState::DECODE_DATA)
            || (call_state.contains(FilterCallState::DECODE_TRAILERS)
                && !self.decoder_filters[index].base.can_iterate());
        if buffering {
            // Watermark policy follows the caller's streaming intent.
            self.state.decoder_filters_streaming = streaming;
            self.common_handle_buffer_data_decoder(index, &mut data);
            Ok(())
        } else if call_state.contains(FilterCallState::DECODE_TRAILERS) {
            // The chain is inside this filter's trailers callback and
            // the filter can iterate: hand the data straight to the
            // filters after it.
            self.dispatch_decode_data(Some(index), data, false, FilterIterationStartState::AlwaysStartFromNext);
            Ok(())
        } else {
            error!(filter = index, call_state = ?call_state, "add_decoded_data called in invalid state");
            Err(FilterChainError::AddDataInvalidCallState)
        }
    }

    pub(crate) fn add_encoded_data(
        &mut self,
        index: usize,
        mut data: BodyBuffer,
        streaming: bool,
    ) -> Result<(), FilterChainError> {
        let call_state = self.state.filter_call_state;
        let buffering = call_state.is_empty()
            || call_state.intersects(FilterCallState::ENCODE_HEADERS | FilterCallState::ENCODE_DATA)
            || (call_state.contains(FilterCallState::ENCODE_TRAILERS)
                && !self.encoder_filters[index].base.can_iterate());
        if buffering {
            self.state.encoder_filters_streaming = streaming;
            self.common_handle_buffer_data_encoder(index, &mut data);
            Ok(())
        } else if call_state.contains(FilterCallState::ENCODE_TRAILERS) {
            self.dispatch_encode_data(Some(index), data, false, FilterIterationStartState::AlwaysStartFromNext);
            Ok(())
        } else {
            error!(filter = index, call_state = ?call_state, "add_encoded_data called in invalid state");
            Err(FilterChainError::AddDataInvalidCallState)
        }
    }

    pub(crate) fn add_decoded_trailers(&mut self) -> Result<(), FilterChainError> {
        if !self.state.filter_call_state.contains(FilterCallState::LAST_DATA_FRAME) {
            error!("request trailers can only be added during the last data frame");
            return Err(FilterChainError::TrailersOutsideLastDataFrame);
        }
        if self.request_trailers.is_some() {
            error!("request trailers were already added");
            return Err(FilterChainError::TrailersAlreadyAdded);
        }
        self.request_trailers = Some(HeaderMap::new());
        Ok(())
    }

    pub(crate) fn add_encoded_trailers(&mut self) -> Result<(), FilterChainError> {
        if !self.state.filter_call_state.contains(FilterCallState::LAST_DATA_FRAME) {
            error!("response trailers can only be added during the last data frame");
            return Err(FilterChainError::TrailersOutsideLastDataFrame);
        }
        if self.response_trailers.is_some() {
            error!("response trailers were already added");
            return Err(FilterChainError::TrailersAlreadyAdded);
        }
        self.response_trailers = Some(HeaderMap::new());
        Ok(())
    }

    pub(crate) fn add_decoded_metadata(&mut self, metadata: MetadataMap) {
        self.added_request_metadata.push(metadata);
    }

    /// Dispatches metadata staged by filters during the last decode
    /// callback. Returns whether anything was staged.
    fn process_newly_added_metadata(&mut self) -> bool {
        if self.added_request_metadata.is_empty() {
            return false;
        }
        let staged = std::mem::take(&mut self.added_request_metadata);
        for metadata in staged {
            self.dispatch_decode_metadata(None, metadata, FilterIterationStartState::CanStartFromCurrent);
        }
        true
    }

    // ---------------------------------------------------------------
    // Buffering
    // ---------------------------------------------------------------

    fn common_handle_buffer_data_decoder(&mut self, _index: usize, data: &mut BodyBuffer) {
        if self.buffered_request_data.is_none() {
            self.buffered_request_data = Some(WatermarkBuffer::new(self.buffer_limit));
        }
        let change = self.buffered_request_data.as_mut().and_then(|buffer| buffer.move_from(data));
        if let Some(change) = change {
            self.on_decoder_buffer_change(change);
        }
    }

    fn common_handle_buffer_data_encoder(&mut self, index: usize, data: &mut BodyBuffer) {
        if self.buffered_response_data.is_none() {
            self.buffered_response_data = Some(WatermarkBuffer::new(self.buffer_limit));
            self.response_buffer_owner = Some(index);
        }
        let change = self.buffered_response_data.as_mut().and_then(|buffer| buffer.move_from(data));
        if let Some(change) = change {
            let owner = self.response_buffer_owner.unwrap_or(index);
            self.on_encoder_buffer_change(change, owner);
        }
    }

    /// Defers the frame on a filter that stopped all iteration.
    /// Returns `true` when the frame was absorbed.
    fn handle_data_if_stop_all_decoder(&mut self, index: usize, data: &mut BodyBuffer) -> bool {
        if !self.decoder_filters[index].base.stopped_all() {
            return false;
        }
        self.state.decoder_filters_streaming =
            self.decoder_filters[index].base.iteration_state == IterationState::StopAllWatermark;
        self.common_handle_buffer_data_decoder(index, data);
        true
    }

    fn handle_data_if_stop_all_encoder(&mut self, index: usize, data: &mut BodyBuffer) -> bool {
        if !self.encoder_filters[index].base.stopped_all() {
            return false;
        }
        self.state.encoder_filters_streaming =
            self.encoder_filters[index].base.iteration_state == IterationState::StopAllWatermark;
        self.common_handle_buffer_data_encoder(index, data);
        true
    }

    // ---------------------------------------------------------------
    // Iteration prefixes
    // ---------------------------------------------------------------

    fn common_decode_prefix(&self, from: Option<usize>, start_state: FilterIterationStartState) -> usize {
        let Some(index) = from else {
            return 0;
        };
        if start_state == FilterIterationStartState::CanStartFromCurrent
            && self.decoder_filters[index].base.iterate_from_current_filter
        {
            // Iteration had stopped for all frame types; the current
            // filter's callback has not run yet for this frame.
            return index;
        }
        index + 1
    }

    fn common_encode_prefix(
        &mut self,
        from: Option<usize>,
        end_stream: bool,
        start_state: FilterIterationStartState,
    ) -> usize {
        let Some(index) = from else {
            // Base state is only touched on the initial call for a
            // frame, never on continuations.
            debug_assert!(!self.state.local_complete);
            self.state.local_complete = end_stream;
            return 0;
        };
        if start_state == FilterIterationStartState::CanStartFromCurrent
            && self.encoder_filters[index].base.iterate_from_current_filter
        {
            return index;
        }
        index + 1
    }

    // ---------------------------------------------------------------
    // Decoder dispatch
    // ---------------------------------------------------------------

    fn dispatch_decode_headers(&mut self, from: Option<usize>, end_stream: bool) {
        let start = self.common_decode_prefix(from, FilterIterationStartState::AlwaysStartFromNext);
        let chain_len = self.decoder_filters.len();
        let mut continue_data_entry: Option<usize> = None;

        let mut index = start;
        while index < chain_len {
            if !self.decoder_filters[index].base.can_iterate() {
                // Stopped earlier; the stored head resumes through
                // this filter's continuation.
                return;
            }
            if self.state.filter_call_state.contains(FilterCallState::DECODE_HEADERS) {
                error!(filter = index, "re-entrant decode headers dispatch dropped");
                debug_assert!(false, "re-entrant decode headers dispatch");
                return;
            }
            self.state.filter_call_state.insert(FilterCallState::DECODE_HEADERS);
            let filter_end_stream =
                self.state.decoding_headers_only || (end_stream && continue_data_entry.is_none());
            self.decoder_filters[index].base.end_stream = filter_end_stream;

            let Some(mut filter) = self.decoder_filters[index].filter.take() else {
                self.state.filter_call_state.remove(FilterCallState::DECODE_HEADERS);
                error!(filter = index, "decode headers re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveDecoderFilter::new(self, index);
                filter.decode_headers(&mut handle, filter_end_stream)
            };
            self.decoder_filters[index].filter = Some(filter);
            self.state.filter_call_state.remove(FilterCallState::DECODE_HEADERS);
            trace!(filter = index, status = ?status, "decode headers called");
            debug_assert!(!(status == FilterHeadersStatus::ContinueAndEndStream && filter_end_stream));
            if self.state.destroyed {
                return;
            }

            let new_metadata_added = self.process_newly_added_metadata();
            // Metadata frames cannot carry end-of-stream: when this
            // filter already saw it in the headers, append an empty
            // last data frame behind the new metadata.
            if self.decoder_filters[index].base.end_stream
                && new_metadata_added
                && self.buffered_request_data.is_none()
            {
                trace!("inserting empty data frame to close the stream after added metadata");
                let _ = self.add_decoded_data(index, BodyBuffer::new(), true);
            }

            self.decoder_filters[index].base.headers_callback_called = true;
            let continue_iteration = self.apply_headers_status_decoder(index, status);
            if !continue_iteration && index + 1 != chain_len {
                // Stop only when this is not the terminal filter: a
                // terminal stop must still let body added by earlier
                // filters flush below.
                return;
            }

            if end_stream && self.buffered_request_data.is_some() && continue_data_entry.is_none() {
                continue_data_entry = Some(index);
            }
            index += 1;
        }

        if let Some(entry) = continue_data_entry {
            // A filter turned a header-only request into one with a
            // body. Resume through the continuation path so headers
            // are not replayed.
            debug_assert!(self.buffered_request_data.is_some());
            self.decoder_filters[entry].base.iteration_state = IterationState::StopSingleIteration;
            self.common_continue_decoder(entry);
        }

        if end_stream {
            self.sink.disarm_request_timeout();
        }
        self.sink.reset_idle_timer();
    }

    fn dispatch_decode_data(
        &mut self,
        from: Option<usize>,
        mut data: BodyBuffer,
        end_stream: bool,
        start_state: FilterIterationStartState,
    ) {
        self.sink.reset_idle_timer();
        if self.state.decoding_headers_only {
            return;
        }
        // Once the response completed locally, filters no longer care
        // about request body; drop it.
        if self.state.local_complete {
            return;
        }

        let trailers_exist_at_start = self.request_trailers.is_some();
        let mut trailers_added_entry: Option<usize> = None;
        let start = self.common_decode_prefix(from, start_state);
        let chain_len = self.decoder_filters.len();

        let mut index = start;
        while index < chain_len {
            if self.handle_data_if_stop_all_decoder(index, &mut data) {
                return;
            }
            // A filter that has seen its end-of-stream must never see
            // another frame; a recursive continuation could otherwise
            // replay this data to it.
            if self.decoder_filters[index].base.end_stream {
                return;
            }
            if self.state.filter_call_state.contains(FilterCallState::DECODE_DATA) {
                error!(filter = index, "re-entrant decode data dispatch dropped");
                debug_assert!(false, "re-entrant decode data dispatch");
                return;
            }
            if end_stream {
                self.state.filter_call_state.insert(FilterCallState::LAST_DATA_FRAME);
            }
            record_latest_data_filter(index, &mut self.latest_data_decoding_filter);
            self.state.filter_call_state.insert(FilterCallState::DECODE_DATA);

            // Trailers may appear while an earlier filter's data
            // callback runs; later filters must then see the stream
            // as still open.
            let filter_end_stream = end_stream && self.request_trailers.is_none();
            self.decoder_filters[index].base.end_stream = filter_end_stream;

            let Some(mut filter) = self.decoder_filters[index].filter.take() else {
                self.state.filter_call_state.remove(FilterCallState::DECODE_DATA | FilterCallState::LAST_DATA_FRAME);
                error!(filter = index, "decode data re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveDecoderFilter::new(self, index);
                filter.decode_data(&mut handle, &mut data, filter_end_stream)
            };
            if filter_end_stream {
                filter.decode_complete();
            }
            self.decoder_filters[index].filter = Some(filter);
            self.state.filter_call_state.remove(FilterCallState::DECODE_DATA);
            if end_stream {
                self.state.filter_call_state.remove(FilterCallState::LAST_DATA_FRAME);
            }
            trace!(filter = index, status = ?status, "decode data called");
            if self.state.destroyed {
                return;
            }

            self.process_newly_added_metadata();

            if !trailers_exist_at_start && self.request_trailers.is_some() && trailers_added_entry.is_none() {
                trailers_added_entry = Some(index);
            }

            let continue_iteration = self.apply_data_status_decoder(index, status, &mut data);
            if !continue_iteration && index + 1 != chain_len {
                // Same terminal-filter exception as headers: trailers
                // added by an earlier filter still need to flush.
                return;
            }
            index += 1;
        }

        if let Some(entry) = trailers_added_entry {
            self.dispatch_decode_trailers(Some(entry));
        }

        if end_stream {
            self.sink.disarm_request_timeout();
        }
    }

    fn dispatch_decode_trailers(&mut self, from: Option<usize>) {
        if self.state.decoding_headers_only {
            return;
        }
        if self.state.local_complete {
            return;
        }

        let start = self.common_decode_prefix(from, FilterIterationStartState::CanStartFromCurrent);
        for index in start..self.decoder_filters.len() {
            if self.decoder_filters[index].base.stopped_all() {
                return;
            }
            if self.state.filter_call_state.contains(FilterCallState::DECODE_TRAILERS) {
                error!(filter = index, "re-entrant decode trailers dispatch dropped");
                debug_assert!(false, "re-entrant decode trailers dispatch");
                return;
            }
            self.state.filter_call_state.insert(FilterCallState::DECODE_TRAILERS);
            let Some(mut filter) = self.decoder_filters[index].filter.take() else {
                self.state.filter_call_state.remove(FilterCallState::DECODE_TRAILERS);
                error!(filter = index, "decode trailers re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveDecoderFilter::new(self, index);
                filter.decode_trailers(&mut handle)
            };
            filter.decode_complete();
            self.decoder_filters[index].filter = Some(filter);
            self.decoder_filters[index].base.end_stream = true;
            self.state.filter_call_state.remove(FilterCallState::DECODE_TRAILERS);
            trace!(filter = index, status = ?status, "decode trailers called");
            if self.state.destroyed {
                return;
            }

            self.process_newly_added_metadata();

            if !self.apply_trailers_status_decoder(index, status) {
                return;
            }
        }
        self.sink.disarm_request_timeout();
    }

    fn dispatch_decode_metadata(
        &mut self,
        from: Option<usize>,
        mut metadata: MetadataMap,
        start_state: FilterIterationStartState,
    ) {
        let start = self.common_decode_prefix(from, start_state);
        for index in start..self.decoder_filters.len() {
            // Defer on a filter that has not finished its headers
            // callback (it may still return StopAll) or that stopped
            // for all frame types.
            let deferred = {
                let base = &self.decoder_filters[index].base;
                !base.headers_callback_called || base.stopped_all()
            };
            if deferred {
                self.decoder_filters[index].base.saved_metadata.push(metadata);
                return;
            }
            let Some(mut filter) = self.decoder_filters[index].filter.take() else {
                error!(filter = index, "decode metadata re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveDecoderFilter::new(self, index);
                filter.decode_metadata(&mut handle, &mut metadata)
            };
            self.decoder_filters[index].filter = Some(filter);
            trace!(filter = index, status = ?status, "decode metadata called");
            if self.state.destroyed {
                return;
            }
        }
        // The terminal decoder filter consumes metadata; nothing goes
        // to the sink on this direction.
    }

    // ---------------------------------------------------------------
    // Decoder status handling
    // ---------------------------------------------------------------

    fn apply_headers_status_decoder(&mut self, index: usize, status: FilterHeadersStatus) -> bool {
        if status == FilterHeadersStatus::ContinueAndEndStream {
            // Continue iteration so the head still flushes, but drop
            // everything after it.
            self.state.decoding_headers_only = true;
            debug!(filter = index, "converting request to headers only");
        }
        {
            let base = &mut self.decoder_filters[index].base;
            debug_assert!(!base.headers_continued);
            debug_assert!(base.can_iterate());
            match status {
                FilterHeadersStatus::StopIteration => base.iteration_state = IterationState::StopSingleIteration,
                FilterHeadersStatus::StopAllIterationAndBuffer => base.iteration_state = IterationState::StopAllBuffer,
                FilterHeadersStatus::StopAllIterationAndWatermark => {
                    base.iteration_state = IterationState::StopAllWatermark
                },
                FilterHeadersStatus::Continue => base.headers_continued = true,
                FilterHeadersStatus::ContinueAndEndStream => {},
            }
        }
        self.handle_metadata_after_headers_callback_decoder(index);
        let base = &self.decoder_filters[index].base;
        !(base.stopped_all() || status == FilterHeadersStatus::StopIteration)
    }

    fn apply_data_status_decoder(&mut self, index: usize, status: FilterDataStatus, data: &mut BodyBuffer) -> bool {
        if status == FilterDataStatus::Continue {
            if self.decoder_filters[index].base.iteration_state == IterationState::StopSingleIteration {
                // Continuing out of a stop: absorb this frame and
                // resume through the continuation path.
                self.common_handle_buffer_data_decoder(index, data);
                self.common_continue_decoder(index);
                return false;
            }
            debug_assert!(self.decoder_filters[index].base.headers_continued);
            return true;
        }

        self.decoder_filters[index].base.iteration_state = IterationState::StopSingleIteration;
        match status {
            FilterDataStatus::StopIterationAndBuffer | FilterDataStatus::StopIterationAndWatermark => {
                self.state.decoder_filters_streaming = status == FilterDataStatus::StopIterationAndWatermark;
                self.common_handle_buffer_data_decoder(index, data);
            },
            FilterDataStatus::StopIterationNoBuffer => {
                if self.state.remote_complete
                    && self.request_trailers.is_none()
                    && self.buffered_request_data.is_none()
                {
                    // Zero-byte end-stream frame with nothing
                    // buffered: allocate an empty buffer so the
                    // resume still emits end-of-stream.
                    debug_assert!(self.decoder_filters[index].base.end_stream);
                    self.buffered_request_data = Some(WatermarkBuffer::new(self.buffer_limit));
                }
            },
            FilterDataStatus::Continue => {},
        }
        false
    }

    fn apply_trailers_status_decoder(&mut self, index: usize, status: FilterTrailersStatus) -> bool {
        match status {
            FilterTrailersStatus::Continue => {
                if self.decoder_filters[index].base.iteration_state == IterationState::StopSingleIteration {
                    self.common_continue_decoder(index);
                    return false;
                }
                debug_assert!(self.decoder_filters[index].base.headers_continued);
                true
            },
            FilterTrailersStatus::StopIteration => {
                self.decoder_filters[index].base.iteration_state = IterationState::StopSingleIteration;
                false
            },
        }
    }

    fn handle_metadata_after_headers_callback_decoder(&mut self, index: usize) {
        // Draining accumulated metadata must start with the current
        // filter.
        let saved = self.decoder_filters[index].base.iterate_from_current_filter;
        self.decoder_filters[index].base.iterate_from_current_filter = true;
        let drain = {
            let base = &self.decoder_filters[index].base;
            // On StopAll the drain waits for the continuation.
            !base.stopped_all() && !base.saved_metadata.is_empty()
        };
        if drain {
            let staged = self.decoder_filters[index].base.saved_metadata.take_all();
            for metadata in staged {
                self.dispatch_decode_metadata(Some(index), metadata, FilterIterationStartState::CanStartFromCurrent);
            }
        }
        self.decoder_filters[index].base.iterate_from_current_filter = saved;
    }

    // ---------------------------------------------------------------
    // Decoder continuation
    // ---------------------------------------------------------------

    fn can_continue_decoder(&self, index: usize) -> bool {
        !self.state.destroyed
            && !self.decoder_filters[index].base.can_iterate()
            && !self.state.filter_call_state.intersects(FilterCallState::DECODING)
    }

    pub(crate) fn common_continue_decoder(&mut self, index: usize) {
        if !self.can_continue_decoder(index) {
            trace!(filter = index, "cannot continue decoder filter chain");
            return;
        }
        trace!(filter = index, "continuing decoder filter chain");
        {
            let base = &mut self.decoder_filters[index].base;
            debug_assert!(!base.can_iterate());
            if base.stopped_all() {
                // The next iteration must include this filter; it has
                // not seen the deferred frames yet.
                base.iterate_from_current_filter = true;
            }
            base.allow_iteration();
        }

        // The zero-byte data frame case is handled as regular
        // buffered data rather than being merged back into a
        // header-only request.
        if !self.decoder_filters[index].base.headers_continued {
            self.decoder_filters[index].base.headers_continued = true;
            let end_stream = self.state.remote_complete
                && self.buffered_request_data.is_none()
                && self.request_trailers.is_none();
            self.dispatch_decode_headers(Some(index), end_stream);
            if self.state.destroyed {
                return;
            }
        }

        self.drain_saved_metadata_decoder(index);

        if self.buffered_request_data.is_some() {
            let (data, change) = match self.buffered_request_data.as_mut() {
                Some(buffer) => buffer.take_all(),
                None => (BodyBuffer::new(), None),
            };
            if let Some(change) = change {
                self.on_decoder_buffer_change(change);
            }
            let end_stream = self.state.remote_complete && self.request_trailers.is_none();
            self.dispatch_decode_data(Some(index), data, end_stream, FilterIterationStartState::CanStartFromCurrent);
            if self.state.destroyed {
                return;
            }
        }

        if self.request_trailers.is_some() {
            self.dispatch_decode_trailers(Some(index));
        }

        if index < self.decoder_filters.len() {
            self.decoder_filters[index].base.iterate_from_current_filter = false;
        }
    }

    fn drain_saved_metadata_decoder(&mut self, index: usize) {
        let staged = self.decoder_filters[index].base.saved_metadata.take_all();
        for metadata in staged {
            self.dispatch_decode_metadata(Some(index), metadata, FilterIterationStartState::CanStartFromCurrent);
        }
    }

    pub(crate) fn inject_decoded_data_to_filter_chain(&mut self, index: usize, data: BodyBuffer, end_stream: bool) {
        self.dispatch_decode_data(Some(index), data, end_stream, FilterIterationStartState::CanStartFromCurrent);
    }

    // ---------------------------------------------------------------
    // Encoder dispatch
    // ---------------------------------------------------------------

    fn dispatch_encode_100_continue_headers(&mut self, from: Option<usize>) {
        self.sink.reset_idle_timer();
        debug_assert!(self.proxy_100_continue);
        // Make sure a later continuation replays the 1xx first.
        self.state.has_continue_headers = true;

        // 1xx implies no end-stream and real headers following, so
        // no continuation bookkeeping beyond the per-filter replay
        // flag is needed.
        let start = self.common_encode_prefix(from, false, FilterIterationStartState::AlwaysStartFromNext);
        for index in start..self.encoder_filters.len() {
            if !self.encoder_filters[index].base.can_iterate() {
                return;
            }
            if self.state.filter_call_state.contains(FilterCallState::ENCODE_100_CONTINUE_HEADERS) {
                error!(filter = index, "re-entrant 100-continue dispatch dropped");
                debug_assert!(false, "re-entrant 100-continue dispatch");
                return;
            }
            self.state.filter_call_state.insert(FilterCallState::ENCODE_100_CONTINUE_HEADERS);
            let Some(mut filter) = self.encoder_filters[index].filter.take() else {
                self.state.filter_call_state.remove(FilterCallState::ENCODE_100_CONTINUE_HEADERS);
                error!(filter = index, "100-continue re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveEncoderFilter::new(self, index);
                filter.encode_100_continue_headers(&mut handle)
            };
            self.encoder_filters[index].filter = Some(filter);
            self.state.filter_call_state.remove(FilterCallState::ENCODE_100_CONTINUE_HEADERS);
            trace!(filter = index, status = ?status, "encode 100 continue headers called");
            if self.state.destroyed {
                return;
            }
            if !self.apply_100_continue_status(index, status) {
                return;
            }
        }

        let (sink, request_headers, continue_headers) =
            (&mut self.sink, &self.request_headers, &self.continue_headers);
        match (request_headers.as_ref(), continue_headers.as_ref()) {
            (Some(request_headers), Some(continue_headers)) => {
                sink.encode_filtered_100_continue_headers(request_headers, continue_headers);
            },
            _ => error!("100-continue completed without request or continue headers"),
        }
    }

    fn dispatch_encode_headers(&mut self, from: Option<usize>, end_stream: bool) {
        self.sink.reset_idle_timer();
        self.sink.disarm_request_timeout();

        let start = self.common_encode_prefix(from, end_stream, FilterIterationStartState::AlwaysStartFromNext);
        let chain_len = self.encoder_filters.len();
        let mut continue_data_entry: Option<usize> = None;

        let mut index = start;
        while index < chain_len {
            if !self.encoder_filters[index].base.can_iterate() {
                return;
            }
            if self.state.filter_call_state.contains(FilterCallState::ENCODE_HEADERS) {
                error!(filter = index, "re-entrant encode headers dispatch dropped");
                debug_assert!(false, "re-entrant encode headers dispatch");
                return;
            }
            self.state.filter_call_state.insert(FilterCallState::ENCODE_HEADERS);
            let filter_end_stream =
                self.state.encoding_headers_only || (end_stream && continue_data_entry.is_none());
            self.encoder_filters[index].base.end_stream = filter_end_stream;

            let Some(mut filter) = self.encoder_filters[index].filter.take() else {
                self.state.filter_call_state.remove(FilterCallState::ENCODE_HEADERS);
                error!(filter = index, "encode headers re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveEncoderFilter::new(self, index);
                filter.encode_headers(&mut handle, filter_end_stream)
            };
            if filter_end_stream {
                filter.encode_complete();
            }
            self.encoder_filters[index].filter = Some(filter);
            self.state.filter_call_state.remove(FilterCallState::ENCODE_HEADERS);
            trace!(filter = index, status = ?status, "encode headers called");
            if self.state.destroyed {
                return;
            }

            self.encoder_filters[index].base.headers_callback_called = true;
            let continue_iteration = self.apply_headers_status_encoder(index, status);

            // A headers-only response means nothing further will be
            // encoded locally.
            if self.state.encoding_headers_only {
                self.state.local_complete = true;
            }

            if !continue_iteration {
                return;
            }

            // A filter added body to a header-only response: stop
            // raising end_stream to the filters after it.
            if end_stream && self.buffered_response_data.is_some() && continue_data_entry.is_none() {
                continue_data_entry = Some(index);
            }
            index += 1;
        }

        let modified_end_stream =
            self.state.encoding_headers_only || (end_stream && continue_data_entry.is_none());
        {
            let (sink, response_headers) = (&mut self.sink, &self.response_headers);
            match response_headers.as_ref() {
                Some(response_headers) => sink.encode_filtered_headers(response_headers, modified_end_stream),
                None => {
                    error!("encode headers completed without response headers");
                    return;
                },
            }
        }
        self.maybe_end_encode(modified_end_stream);

        if let Some(entry) = continue_data_entry {
            if !modified_end_stream {
                // Reuse the continuation path so headers are not run
                // a second time.
                debug_assert!(self.buffered_response_data.is_some());
                self.encoder_filters[entry].base.iteration_state = IterationState::StopSingleIteration;
                self.common_continue_encoder(entry);
            }
        }
    }

    fn dispatch_encode_data(
        &mut self,
        from: Option<usize>,
        mut data: BodyBuffer,
        end_stream: bool,
        start_state: FilterIterationStartState,
    ) {
        self.sink.reset_idle_timer();
        if self.state.encoding_headers_only {
            return;
        }

        let trailers_exist_at_start = self.response_trailers.is_some();
        let mut trailers_added_entry: Option<usize> = None;
        let start = self.common_encode_prefix(from, end_stream, start_state);
        let chain_len = self.encoder_filters.len();

        let mut index = start;
        while index < chain_len {
            if self.handle_data_if_stop_all_encoder(index, &mut data) {
                return;
            }
            if self.encoder_filters[index].base.end_stream {
                return;
            }
            if self.state.filter_call_state.contains(FilterCallState::ENCODE_DATA) {
                error!(filter = index, "re-entrant encode data dispatch dropped");
                debug_assert!(false, "re-entrant encode data dispatch");
                return;
            }
            self.state.filter_call_state.insert(FilterCallState::ENCODE_DATA);
            if end_stream {
                self.state.filter_call_state.insert(FilterCallState::LAST_DATA_FRAME);
            }
            record_latest_data_filter(index, &mut self.latest_data_encoding_filter);

            let filter_end_stream = end_stream && self.response_trailers.is_none();
            self.encoder_filters[index].base.end_stream = filter_end_stream;

            let Some(mut filter) = self.encoder_filters[index].filter.take() else {
                self.state.filter_call_state.remove(FilterCallState::ENCODE_DATA | FilterCallState::LAST_DATA_FRAME);
                error!(filter = index, "encode data re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveEncoderFilter::new(self, index);
                filter.encode_data(&mut handle, &mut data, filter_end_stream)
            };
            if filter_end_stream {
                filter.encode_complete();
            }
            self.encoder_filters[index].filter = Some(filter);
            self.state.filter_call_state.remove(FilterCallState::ENCODE_DATA);
            if end_stream {
                self.state.filter_call_state.remove(FilterCallState::LAST_DATA_FRAME);
            }
            trace!(filter = index, status = ?status, "encode data called");
            if self.state.destroyed {
                return;
            }

            if !trailers_exist_at_start && self.response_trailers.is_some() && trailers_added_entry.is_none() {
                trailers_added_entry = Some(index);
            }

            if !self.apply_data_status_encoder(index, status, &mut data) {
                return;
            }
            index += 1;
        }

        let modified_end_stream = end_stream && trailers_added_entry.is_none();
        self.sink.encode_filtered_data(data, modified_end_stream);
        self.maybe_end_encode(modified_end_stream);

        if let Some(entry) = trailers_added_entry {
            self.dispatch_encode_trailers(Some(entry));
        }
    }

    fn dispatch_encode_trailers(&mut self, from: Option<usize>) {
        self.sink.reset_idle_timer();
        if self.state.encoding_headers_only {
            return;
        }

        let start = self.common_encode_prefix(from, true, FilterIterationStartState::CanStartFromCurrent);
        for index in start..self.encoder_filters.len() {
            if self.encoder_filters[index].base.stopped_all() {
                return;
            }
            if self.state.filter_call_state.contains(FilterCallState::ENCODE_TRAILERS) {
                error!(filter = index, "re-entrant encode trailers dispatch dropped");
                debug_assert!(false, "re-entrant encode trailers dispatch");
                return;
            }
            self.state.filter_call_state.insert(FilterCallState::ENCODE_TRAILERS);
            let Some(mut filter) = self.encoder_filters[index].filter.take() else {
                self.state.filter_call_state.remove(FilterCallState::ENCODE_TRAILERS);
                error!(filter = index, "encode trailers re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveEncoderFilter::new(self, index);
                filter.encode_trailers(&mut handle)
            };
            filter.encode_complete();
            self.encoder_filters[index].filter = Some(filter);
            self.encoder_filters[index].base.end_stream = true;
            self.state.filter_call_state.remove(FilterCallState::ENCODE_TRAILERS);
            trace!(filter = index, status = ?status, "encode trailers called");
            if self.state.destroyed {
                return;
            }
            if !self.apply_trailers_status_encoder(index, status) {
                return;
            }
        }

        {
            let (sink, response_trailers) = (&mut self.sink, &self.response_trailers);
            match response_trailers.as_ref() {
                Some(response_trailers) => sink.encode_filtered_trailers(response_trailers),
                None => {
                    error!("encode trailers completed without response trailers");
                    return;
                },
            }
        }
        self.maybe_end_encode(true);
    }

    fn dispatch_encode_metadata(
        &mut self,
        from: Option<usize>,
        mut metadata: MetadataMap,
        start_state: FilterIterationStartState,
    ) {
        self.sink.reset_idle_timer();

        let start = self.common_encode_prefix(from, false, start_state);
        for index in start..self.encoder_filters.len() {
            let deferred = {
                let base = &self.encoder_filters[index].base;
                !base.headers_callback_called || base.stopped_all()
            };
            if deferred {
                self.encoder_filters[index].base.saved_metadata.push(metadata);
                return;
            }
            let Some(mut filter) = self.encoder_filters[index].filter.take() else {
                error!(filter = index, "encode metadata re-entered a running filter");
                return;
            };
            let status = {
                let mut handle = ActiveEncoderFilter::new(self, index);
                filter.encode_metadata(&mut handle, &mut metadata)
            };
            self.encoder_filters[index].filter = Some(filter);
            trace!(filter = index, status = ?status, "encode metadata called");
            if self.state.destroyed {
                return;
            }
        }

        if !metadata.is_empty() {
            debug!("encoding metadata via codec");
            self.sink.encode_filtered_metadata(vec![metadata]);
        }
    }

    // ---------------------------------------------------------------
    // Encoder status handling
    // ---------------------------------------------------------------

    fn apply_100_continue_status(&mut self, index: usize, status: FilterHeadersStatus) -> bool {
        debug_assert!(self.state.has_continue_headers);
        let entry = &mut self.encoder_filters[index];
        debug_assert!(!entry.continue_headers_continued);
        debug_assert!(entry.base.can_iterate());
        match status {
            FilterHeadersStatus::StopIteration => {
                entry.base.iteration_state = IterationState::StopSingleIteration;
                false
            },
            FilterHeadersStatus::StopAllIterationAndBuffer => {
                entry.base.iteration_state = IterationState::StopAllBuffer;
                false
            },
            FilterHeadersStatus::StopAllIterationAndWatermark => {
                entry.base.iteration_state = IterationState::StopAllWatermark;
                false
            },
            FilterHeadersStatus::Continue | FilterHeadersStatus::ContinueAndEndStream => {
                debug_assert!(status == FilterHeadersStatus::Continue);
                entry.continue_headers_continued = true;
                true
            },
        }
    }

    fn apply_headers_status_encoder(&mut self, index: usize, status: FilterHeadersStatus) -> bool {
        if status == FilterHeadersStatus::ContinueAndEndStream {
            self.state.encoding_headers_only = true;
            debug!(filter = index, "converting response to headers only");
        }
        {
            let base = &mut self.encoder_filters[index].base;
            debug_assert!(!base.headers_continued);
            debug_assert!(base.can_iterate());
            match status {
                FilterHeadersStatus::StopIteration => base.iteration_state = IterationState::StopSingleIteration,
                FilterHeadersStatus::StopAllIterationAndBuffer => base.iteration_state = IterationState::StopAllBuffer,
                FilterHeadersStatus::StopAllIterationAndWatermark => {
                    base.iteration_state = IterationState::StopAllWatermark
                },
                FilterHeadersStatus::Continue => base.headers_continued = true,
                FilterHeadersStatus::ContinueAndEndStream => {},
            }
        }
        self.handle_metadata_after_headers_callback_encoder(index);
        let base = &self.encoder_filters[index].base;
        !(base.stopped_all() || status == FilterHeadersStatus::StopIteration)
    }

    fn apply_data_status_encoder(&mut self, index: usize, status: FilterDataStatus, data: &mut BodyBuffer) -> bool {
        if status == FilterDataStatus::Continue {
            if self.encoder_filters[index].base.iteration_state == IterationState::StopSingleIteration {
                self.common_handle_buffer_data_encoder(index, data);
                self.common_continue_encoder(index);
                return false;
            }
            debug_assert!(self.encoder_filters[index].base.headers_continued);
            return true;
        }

        self.encoder_filters[index].base.iteration_state = IterationState::StopSingleIteration;
        match status {
            FilterDataStatus::StopIterationAndBuffer | FilterDataStatus::StopIterationAndWatermark => {
                self.state.encoder_filters_streaming = status == FilterDataStatus::StopIterationAndWatermark;
                self.common_handle_buffer_data_encoder(index, data);
            },
            FilterDataStatus::StopIterationNoBuffer => {
                if self.state.local_complete
                    && self.response_trailers.is_none()
                    && self.buffered_response_data.is_none()
                {
                    debug_assert!(self.encoder_filters[index].base.end_stream);
                    self.buffered_response_data = Some(WatermarkBuffer::new(self.buffer_limit));
                    self.response_buffer_owner = Some(index);
                }
            },
            FilterDataStatus::Continue => {},
        }
        false
    }

    fn apply_trailers_status_encoder(&mut self, index: usize, status: FilterTrailersStatus) -> bool {
        match status {
            FilterTrailersStatus::Continue => {
                if self.encoder_filters[index].base.iteration_state == IterationState::StopSingleIteration {
                    self.common_continue_encoder(index);
                    return false;
                }
                debug_assert!(self.encoder_filters[index].base.headers_continued);
                true
            },
            FilterTrailersStatus::StopIteration => {
                self.encoder_filters[index].base.iteration_state = IterationState::StopSingleIteration;
                false
            },
        }
    }

    fn handle_metadata_after_headers_callback_encoder(&mut self, index: usize) {
        let saved = self.encoder_filters[index].base.iterate_from_current_filter;
        self.encoder_filters[index].base.iterate_from_current_filter = true;
        let drain = {
            let base = &self.encoder_filters[index].base;
            !base.stopped_all() && !base.saved_metadata.is_empty()
        };
        if drain {
            let staged = self.encoder_filters[index].base.saved_metadata.take_all();
            for metadata in staged {
                self.dispatch_encode_metadata(Some(index), metadata, FilterIterationStartState::CanStartFromCurrent);
            }
        }
        self.encoder_filters[index].base.iterate_from_current_filter = saved;
    }

    // ---------------------------------------------------------------
    // Encoder continuation
    // ---------------------------------------------------------------

    fn can_continue_encoder(&self, index: usize) -> bool {
        !self.state.destroyed
            && !self.encoder_filters[index].base.can_iterate()
            && !self.state.filter_call_state.intersects(FilterCallState::ENCODING)
    }

    pub(crate) fn common_continue_encoder(&mut self, index: usize) {
        if !self.can_continue_encoder(index) {
            trace!(filter = index, "cannot continue encoder filter chain");
            return;
        }
        trace!(filter = index, "continuing encoder filter chain");
        {
            let base = &mut self.encoder_filters[index].base;
            debug_assert!(!base.can_iterate());
            if base.stopped_all() {
                base.iterate_from_current_filter = true;
            }
            base.allow_iteration();
        }

        // Only replay the 1xx when one was actually observed.
        if self.state.has_continue_headers && !self.encoder_filters[index].continue_headers_continued {
            self.encoder_filters[index].continue_headers_continued = true;
            self.dispatch_encode_100_continue_headers(Some(index));
            if self.state.destroyed {
                return;
            }
            // Until the real response head arrives there is nothing
            // further to resume.
            if self.response_headers.is_none() {
                return;
            }
        }

        if !self.encoder_filters[index].base.headers_continued {
            self.encoder_filters[index].base.headers_continued = true;
            let end_stream = self.state.local_complete
                && self.buffered_response_data.is_none()
                && self.response_trailers.is_none();
            self.dispatch_encode_headers(Some(index), end_stream);
            if self.state.destroyed {
                return;
            }
        }

        self.drain_saved_metadata_encoder(index);

        if self.buffered_response_data.is_some() {
            let (data, change) = match self.buffered_response_data.as_mut() {
                Some(buffer) => buffer.take_all(),
                None => (BodyBuffer::new(), None),
            };
            if let Some(change) = change {
                let owner = self.response_buffer_owner.unwrap_or(index);
                self.on_encoder_buffer_change(change, owner);
            }
            let end_stream = self.state.local_complete && self.response_trailers.is_none();
            self.dispatch_encode_data(Some(index), data, end_stream, FilterIterationStartState::CanStartFromCurrent);
            if self.state.destroyed {
                return;
            }
        }

        if self.response_trailers.is_some() {
            self.dispatch_encode_trailers(Some(index));
        }

        if index < self.encoder_filters.len() {
            self.encoder_filters[index].base.iterate_from_current_filter = false;
        }
    }

    fn drain_saved_metadata_encoder(&mut self, index: usize) {
        let staged = self.encoder_filters[index].base.saved_metadata.take_all();
        for metadata in staged {
            self.dispatch_encode_metadata(Some(index), metadata, FilterIterationStartState::CanStartFromCurrent);
        }
    }

    pub(crate) fn inject_encoded_data_to_filter_chain(&mut self, index: usize, data: BodyBuffer, end_stream: bool) {
        self.dispatch_encode_data(Some(index), data, end_stream, FilterIterationStartState::CanStartFromCurrent);
    }

    pub(crate) fn encode_metadata_from_filter(&mut self, index: usize, metadata: MetadataMap) {
        self.dispatch_encode_metadata(Some(index), metadata, FilterIterationStartState::CanStartFromCurrent);
    }
}
