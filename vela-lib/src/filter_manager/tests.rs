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

use super::*;
use crate::body::BodyBuffer;
use crate::filters::{
    DecoderFilter, DecoderFilterCallbacks, DownstreamWatermarkCallbacks, EncoderFilter, EncoderFilterCallbacks,
    FilterChainError, FilterDataStatus, FilterHeadersStatus, FilterMetadataStatus, FilterTrailersStatus,
};
use crate::metadata::MetadataMap;
use crate::sink::{FilterChainBuilder, FilterChainFactory, StreamSink};
use crate::stream_info::{response_code_details, ResponseFlags, StreamInfo};
use crate::{RequestHead, ResponseHead};
use bytes::Bytes;
use http::header::UPGRADE;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use parking_lot::Mutex;
use route_cache::{ClusterInfo, Route, RouteEntry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_test::traced_test;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    // Filter observations.
    DecodeHeaders { filter: &'static str, end_stream: bool },
    DecodeData { filter: &'static str, data: Bytes, end_stream: bool },
    DecodeTrailers { filter: &'static str },
    DecodeMetadata { filter: &'static str, metadata: MetadataMap },
    DecodeComplete { filter: &'static str },
    Encode100ContinueHeaders { filter: &'static str },
    EncodeHeaders { filter: &'static str, end_stream: bool },
    EncodeData { filter: &'static str, data: Bytes, end_stream: bool },
    EncodeTrailers { filter: &'static str },
    EncodeMetadata { filter: &'static str, metadata: MetadataMap },
    EncodeComplete { filter: &'static str },
    // Sink observations.
    SinkContinueHeaders { status: u16 },
    SinkHeaders { status: u16, end_stream: bool },
    SinkData { data: Bytes, end_stream: bool },
    SinkMetadata { frames: usize },
    SinkTrailers,
    SinkEndStream,
    SinkLocalReset,
    SinkDecoderAboveHigh,
    SinkDecoderBelowLow,
    SinkRequestTooLarge,
    SinkResponseTooLarge,
    SinkUpgrade,
    SinkIdleTimeout,
    SinkRequestTimeout,
    SinkMaxDuration,
    // Downstream watermark registrant observations.
    AboveHigh,
    BelowLow,
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock())
    }
}

#[derive(Clone, Default)]
struct SinkState {
    disarm_request_timeout: Arc<AtomicUsize>,
    cancel_timers: Arc<AtomicUsize>,
    route_evaluations: Arc<AtomicUsize>,
    last_response_headers: Arc<Mutex<Option<HeaderMap>>>,
}

struct RecordingSink {
    rec: Recorder,
    state: SinkState,
    route: Option<Arc<Route>>,
    accept_new_stream: bool,
}

impl StreamSink for RecordingSink {
    fn encode_filtered_100_continue_headers(&mut self, _request_headers: &RequestHead, response_headers: &ResponseHead) {
        self.rec.push(Event::SinkContinueHeaders { status: response_headers.status.as_u16() });
    }

    fn encode_filtered_headers(&mut self, response_headers: &ResponseHead, end_stream: bool) {
        *self.state.last_response_headers.lock() = Some(response_headers.headers.clone());
        self.rec.push(Event::SinkHeaders { status: response_headers.status.as_u16(), end_stream });
    }

    fn encode_filtered_data(&mut self, data: BodyBuffer, end_stream: bool) {
        self.rec.push(Event::SinkData { data: data.to_bytes(), end_stream });
    }

    fn encode_filtered_metadata(&mut self, metadata: Vec<MetadataMap>) {
        self.rec.push(Event::SinkMetadata { frames: metadata.len() });
    }

    fn encode_filtered_trailers(&mut self, _trailers: &HeaderMap) {
        self.rec.push(Event::SinkTrailers);
    }

    fn end_stream(&mut self) {
        self.rec.push(Event::SinkEndStream);
    }

    fn on_local_reset_stream(&mut self) {
        self.rec.push(Event::SinkLocalReset);
    }

    fn decoder_above_write_buffer_high_watermark(&mut self) {
        self.rec.push(Event::SinkDecoderAboveHigh);
    }

    fn decoder_below_write_buffer_low_watermark(&mut self) {
        self.rec.push(Event::SinkDecoderBelowLow);
    }

    fn request_too_large(&mut self) {
        self.rec.push(Event::SinkRequestTooLarge);
    }

    fn response_data_too_large(&mut self) {
        self.rec.push(Event::SinkResponseTooLarge);
    }

    fn on_upgrade(&mut self) {
        self.rec.push(Event::SinkUpgrade);
    }

    fn on_idle_timeout(&mut self) {
        self.rec.push(Event::SinkIdleTimeout);
    }

    fn on_request_timeout(&mut self) {
        self.rec.push(Event::SinkRequestTimeout);
    }

    fn on_stream_max_duration_reached(&mut self) {
        self.rec.push(Event::SinkMaxDuration);
    }

    fn disarm_request_timeout(&mut self) {
        self.state.disarm_request_timeout.fetch_add(1, Ordering::Relaxed);
    }

    fn cancel_timers(&mut self) {
        self.state.cancel_timers.fetch_add(1, Ordering::Relaxed);
    }

    fn new_stream(&mut self, headers: RequestHead) -> Option<RequestHead> {
        if self.accept_new_stream {
            None
        } else {
            Some(headers)
        }
    }

    fn evaluate_route(&mut self, _headers: &RequestHead, _stream_info: &StreamInfo) -> Option<Arc<Route>> {
        self.state.route_evaluations.fetch_add(1, Ordering::Relaxed);
        self.route.clone()
    }
}

struct ScriptedFactory {
    chain: Mutex<Option<FilterChainBuilder>>,
    upgrade: Mutex<Option<FilterChainBuilder>>,
}

impl FilterChainFactory for ScriptedFactory {
    fn create_filter_chain(&self, chain: &mut FilterChainBuilder) {
        if let Some(mut built) = self.chain.lock().take() {
            chain.decoder_filters.append(&mut built.decoder_filters);
            chain.encoder_filters.append(&mut built.encoder_filters);
        }
    }

    fn create_upgrade_filter_chain(
        &self,
        _upgrade: &str,
        _upgrade_map: Option<&std::collections::HashMap<compact_str::CompactString, bool>>,
        chain: &mut FilterChainBuilder,
    ) -> bool {
        match self.upgrade.lock().take() {
            Some(mut built) => {
                chain.decoder_filters.append(&mut built.decoder_filters);
                chain.encoder_filters.append(&mut built.encoder_filters);
                true
            },
            None => false,
        }
    }
}

type DecoderHook = Box<dyn FnMut(&mut dyn DecoderFilterCallbacks)>;
type EncoderHook = Box<dyn FnMut(&mut dyn EncoderFilterCallbacks)>;

struct TestDecoder {
    name: &'static str,
    rec: Recorder,
    headers_status: FilterHeadersStatus,
    data_status: FilterDataStatus,
    trailers_status: FilterTrailersStatus,
    on_headers: Option<DecoderHook>,
    on_data: Option<DecoderHook>,
    on_trailers: Option<DecoderHook>,
}

impl TestDecoder {
    fn new(name: &'static str, rec: &Recorder) -> Self {
        TestDecoder {
            name,
            rec: rec.clone(),
            headers_status: FilterHeadersStatus::Continue,
            data_status: FilterDataStatus::Continue,
            trailers_status: FilterTrailersStatus::Continue,
            on_headers: None,
            on_data: None,
            on_trailers: None,
        }
    }

    fn headers_status(mut self, status: FilterHeadersStatus) -> Self {
        self.headers_status = status;
        self
    }

    fn data_status(mut self, status: FilterDataStatus) -> Self {
        self.data_status = status;
        self
    }

    fn trailers_status(mut self, status: FilterTrailersStatus) -> Self {
        self.trailers_status = status;
        self
    }

    fn on_headers(mut self, hook: impl FnMut(&mut dyn DecoderFilterCallbacks) + 'static) -> Self {
        self.on_headers = Some(Box::new(hook));
        self
    }

    fn on_data(mut self, hook: impl FnMut(&mut dyn DecoderFilterCallbacks) + 'static) -> Self {
        self.on_data = Some(Box::new(hook));
        self
    }

    fn on_trailers(mut self, hook: impl FnMut(&mut dyn DecoderFilterCallbacks) + 'static) -> Self {
        self.on_trailers = Some(Box::new(hook));
        self
    }

    fn boxed(self) -> Box<dyn DecoderFilter> {
        Box::new(self)
    }
}

impl DecoderFilter for TestDecoder {
    fn decode_headers(&mut self, f: &mut dyn DecoderFilterCallbacks, end_stream: bool) -> FilterHeadersStatus {
        self.rec.push(Event::DecodeHeaders { filter: self.name, end_stream });
        if let Some(hook) = self.on_headers.as_mut() {
            hook(f);
        }
        self.headers_status
    }

    fn decode_data(
        &mut self,
        f: &mut dyn DecoderFilterCallbacks,
        data: &mut BodyBuffer,
        end_stream: bool,
    ) -> FilterDataStatus {
        self.rec.push(Event::DecodeData { filter: self.name, data: data.to_bytes(), end_stream });
        if let Some(hook) = self.on_data.as_mut() {
            hook(f);
        }
        self.data_status
    }

    fn decode_trailers(&mut self, f: &mut dyn DecoderFilterCallbacks) -> FilterTrailersStatus {
        self.rec.push(Event::DecodeTrailers { filter: self.name });
        if let Some(hook) = self.on_trailers.as_mut() {
            hook(f);
        }
        self.trailers_status
    }

    fn decode_metadata(&mut self, _f: &mut dyn DecoderFilterCallbacks, metadata: &mut MetadataMap) -> FilterMetadataStatus {
        self.rec.push(Event::DecodeMetadata { filter: self.name, metadata: metadata.clone() });
        FilterMetadataStatus::Continue
    }

    fn decode_complete(&mut self) {
        self.rec.push(Event::DecodeComplete { filter: self.name });
    }
}

struct TestEncoder {
    name: &'static str,
    rec: Recorder,
    continue_headers_status: FilterHeadersStatus,
    headers_status: FilterHeadersStatus,
    data_status: FilterDataStatus,
    trailers_status: FilterTrailersStatus,
    on_headers: Option<EncoderHook>,
    on_data: Option<EncoderHook>,
    on_trailers: Option<EncoderHook>,
}

impl TestEncoder {
    fn new(name: &'static str, rec: &Recorder) -> Self {
        TestEncoder {
            name,
            rec: rec.clone(),
            continue_headers_status: FilterHeadersStatus::Continue,
            headers_status: FilterHeadersStatus::Continue,
            data_status: FilterDataStatus::Continue,
            trailers_status: FilterTrailersStatus::Continue,
            on_headers: None,
            on_data: None,
            on_trailers: None,
        }
    }

    fn continue_headers_status(mut self, status: FilterHeadersStatus) -> Self {
        self.continue_headers_status = status;
        self
    }

    fn headers_status(mut self, status: FilterHeadersStatus) -> Self {
        self.headers_status = status;
        self
    }

    fn data_status(mut self, status: FilterDataStatus) -> Self {
        self.data_status = status;
        self
    }

    fn on_headers(mut self, hook: impl FnMut(&mut dyn EncoderFilterCallbacks) + 'static) -> Self {
        self.on_headers = Some(Box::new(hook));
        self
    }

    fn on_trailers(mut self, hook: impl FnMut(&mut dyn EncoderFilterCallbacks) + 'static) -> Self {
        self.on_trailers = Some(Box::new(hook));
        self
    }

    fn boxed(self) -> Box<dyn EncoderFilter> {
        Box::new(self)
    }
}

impl EncoderFilter for TestEncoder {
    fn encode_100_continue_headers(&mut self, _f: &mut dyn EncoderFilterCallbacks) -> FilterHeadersStatus {
        self.rec.push(Event::Encode100ContinueHeaders { filter: self.name });
        self.continue_headers_status
    }

    fn encode_headers(&mut self, f: &mut dyn EncoderFilterCallbacks, end_stream: bool) -> FilterHeadersStatus {
        self.rec.push(Event::EncodeHeaders { filter: self.name, end_stream });
        if let Some(hook) = self.on_headers.as_mut() {
            hook(f);
        }
        self.headers_status
    }

    fn encode_data(
        &mut self,
        f: &mut dyn EncoderFilterCallbacks,
        data: &mut BodyBuffer,
        end_stream: bool,
    ) -> FilterDataStatus {
        self.rec.push(Event::EncodeData { filter: self.name, data: data.to_bytes(), end_stream });
        if let Some(hook) = self.on_data.as_mut() {
            hook(f);
        }
        self.data_status
    }

    fn encode_trailers(&mut self, f: &mut dyn EncoderFilterCallbacks) -> FilterTrailersStatus {
        self.rec.push(Event::EncodeTrailers { filter: self.name });
        if let Some(hook) = self.on_trailers.as_mut() {
            hook(f);
        }
        self.trailers_status
    }

    fn encode_metadata(&mut self, _f: &mut dyn EncoderFilterCallbacks, metadata: &mut MetadataMap) -> FilterMetadataStatus {
        self.rec.push(Event::EncodeMetadata { filter: self.name, metadata: metadata.clone() });
        FilterMetadataStatus::Continue
    }

    fn encode_complete(&mut self) {
        self.rec.push(Event::EncodeComplete { filter: self.name });
    }
}

struct Harness {
    rec: Recorder,
    config: HttpFilterChainConfig,
    decoders: Vec<Box<dyn DecoderFilter>>,
    encoders: Vec<Box<dyn EncoderFilter>>,
    upgrade_decoders: Option<Vec<Box<dyn DecoderFilter>>>,
    route: Option<Arc<Route>>,
    accept_new_stream: bool,
}

impl Harness {
    fn new(rec: &Recorder) -> Self {
        Harness {
            rec: rec.clone(),
            config: HttpFilterChainConfig::default(),
            decoders: Vec::new(),
            encoders: Vec::new(),
            upgrade_decoders: None,
            route: None,
            accept_new_stream: false,
        }
    }

    fn config(mut self, config: HttpFilterChainConfig) -> Self {
        self.config = config;
        self
    }

    fn decoder(mut self, filter: TestDecoder) -> Self {
        self.decoders.push(filter.boxed());
        self
    }

    fn encoder(mut self, filter: TestEncoder) -> Self {
        self.encoders.push(filter.boxed());
        self
    }

    fn upgrade_decoder(mut self, filter: TestDecoder) -> Self {
        self.upgrade_decoders.get_or_insert_with(Vec::new).push(filter.boxed());
        self
    }

    fn route(mut self, route: Arc<Route>) -> Self {
        self.route = Some(route);
        self
    }

    fn accept_new_stream(mut self) -> Self {
        self.accept_new_stream = true;
        self
    }

    fn build(self) -> (FilterManager, SinkState) {
        let state = SinkState::default();
        let mut chain = FilterChainBuilder::default();
        for filter in self.decoders {
            chain.add_decoder_filter(filter);
        }
        for filter in self.encoders {
            chain.add_encoder_filter(filter);
        }
        let upgrade = self.upgrade_decoders.map(|filters| {
            let mut upgrade_chain = FilterChainBuilder::default();
            for filter in filters {
                upgrade_chain.add_decoder_filter(filter);
            }
            upgrade_chain
        });
        let factory =
            Arc::new(ScriptedFactory { chain: Mutex::new(Some(chain)), upgrade: Mutex::new(upgrade) });
        let sink = RecordingSink {
            rec: self.rec,
            state: state.clone(),
            route: self.route,
            accept_new_stream: self.accept_new_stream,
        };
        let fm = FilterManager::builder(self.config, Box::new(sink), factory).build();
        (fm, state)
    }
}

fn request_head(path: &str) -> RequestHead {
    let (head, ()) = Request::builder().uri(path).body(()).unwrap().into_parts();
    head
}

fn upgrade_request_head() -> RequestHead {
    let mut head = request_head("/");
    head.headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    head
}

fn response_head(status: u16) -> ResponseHead {
    let (mut head, ()) = Response::new(()).into_parts();
    head.status = StatusCode::from_u16(status).unwrap();
    head
}

fn meta(key: &str, value: &str) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    metadata.insert(key.into(), value.into());
    metadata
}

struct WatermarkProbe {
    rec: Recorder,
}

impl DownstreamWatermarkCallbacks for WatermarkProbe {
    fn on_above_write_buffer_high_watermark(&self) {
        self.rec.push(Event::AboveHigh);
    }

    fn on_below_write_buffer_low_watermark(&self) {
        self.rec.push(Event::BelowLow);
    }
}

// ---------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------

#[traced_test]
#[test]
fn headers_only_request_flows_through_both_filters() {
    let rec = Recorder::default();
    let (mut fm, sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), true);

    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeHeaders { filter: "a", end_stream: true },
            Event::DecodeHeaders { filter: "b", end_stream: true },
        ]
    );
    assert_eq!(sink.disarm_request_timeout.load(Ordering::Relaxed), 1);
}

#[test]
fn stop_iteration_then_add_body_at_headers_time() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(
            TestDecoder::new("a", &rec)
                .headers_status(FilterHeadersStatus::StopIteration)
                .on_headers(|f| f.add_decoded_data("hello".into(), false).unwrap()),
        )
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), true);
    assert_eq!(rec.take(), vec![Event::DecodeHeaders { filter: "a", end_stream: true }]);

    fm.continue_decoding(0);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeHeaders { filter: "b", end_stream: false },
            Event::DecodeData { filter: "b", data: Bytes::from_static(b"hello"), end_stream: true },
            Event::DecodeComplete { filter: "b" },
        ]
    );
}

#[test]
fn stop_all_buffer_defers_metadata_and_data_until_continue() {
    let rec = Recorder::default();
    let (mut fm, sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).headers_status(FilterHeadersStatus::StopAllIterationAndBuffer))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    fm.decode_metadata(meta("k", "m1"));
    fm.decode_data("abc".into(), true);
    // Everything past the stopped filter is deferred.
    assert_eq!(rec.take(), vec![Event::DecodeHeaders { filter: "a", end_stream: false }]);
    assert_eq!(sink.disarm_request_timeout.load(Ordering::Relaxed), 0);

    fm.continue_decoding(0);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeHeaders { filter: "b", end_stream: false },
            Event::DecodeMetadata { filter: "a", metadata: meta("k", "m1") },
            Event::DecodeMetadata { filter: "b", metadata: meta("k", "m1") },
            Event::DecodeData { filter: "a", data: Bytes::from_static(b"abc"), end_stream: true },
            Event::DecodeComplete { filter: "a" },
            Event::DecodeData { filter: "b", data: Bytes::from_static(b"abc"), end_stream: true },
            Event::DecodeComplete { filter: "b" },
        ]
    );
    assert_eq!(sink.disarm_request_timeout.load(Ordering::Relaxed), 1);
}

#[test]
fn trailers_added_during_data_reach_later_filters() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).on_data(|f| {
            let trailers = f.add_decoded_trailers().unwrap();
            trailers.insert("x-late", HeaderValue::from_static("1"));
        }))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.decode_data("x".into(), true);
    assert_eq!(
        rec.take(),
        vec![
            // The adding filter itself still sees the original
            // end-of-stream marking.
            Event::DecodeData { filter: "a", data: Bytes::from_static(b"x"), end_stream: true },
            Event::DecodeComplete { filter: "a" },
            Event::DecodeData { filter: "b", data: Bytes::from_static(b"x"), end_stream: false },
            Event::DecodeTrailers { filter: "b" },
            Event::DecodeComplete { filter: "b" },
        ]
    );
}

#[test]
fn continue_headers_replay_before_response_headers_on_resume() {
    let rec = Recorder::default();
    let config = HttpFilterChainConfig { proxy_100_continue: true, ..HttpFilterChainConfig::default() };
    let (mut fm, _sink) = Harness::new(&rec)
        .config(config)
        .encoder(
            TestEncoder::new("a", &rec).continue_headers_status(FilterHeadersStatus::StopAllIterationAndBuffer),
        )
        .build();

    fm.decode_headers(request_head("/"), true);
    fm.encode_100_continue_headers(response_head(100));
    fm.encode_headers(response_head(200), true);
    // The 1xx stopped on the filter and the 200 is parked behind it.
    assert_eq!(rec.take(), vec![Event::Encode100ContinueHeaders { filter: "a" }]);

    fm.continue_encoding(0);
    assert_eq!(
        rec.take(),
        vec![
            Event::SinkContinueHeaders { status: 100 },
            Event::SinkHeaders { status: 200, end_stream: true },
            Event::SinkEndStream,
        ]
    );
}

#[test]
fn headers_only_response_with_body_added_during_encode_headers() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .encoder(TestEncoder::new("a", &rec).on_headers(|f| f.add_encoded_data("body".into(), false).unwrap()))
        .build();

    fm.decode_headers(request_head("/"), true);
    rec.take();

    fm.encode_headers(response_head(200), true);
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeHeaders { filter: "a", end_stream: true },
            Event::EncodeComplete { filter: "a" },
            Event::SinkHeaders { status: 200, end_stream: false },
            Event::SinkData { data: Bytes::from_static(b"body"), end_stream: true },
            Event::SinkEndStream,
        ]
    );
}

// ---------------------------------------------------------------
// Iteration details
// ---------------------------------------------------------------

#[test]
fn continue_and_end_stream_converts_to_headers_only() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).headers_status(FilterHeadersStatus::ContinueAndEndStream))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeHeaders { filter: "a", end_stream: false },
            Event::DecodeHeaders { filter: "b", end_stream: true },
        ]
    );

    // Body arriving later is discarded without filter involvement.
    fm.decode_data("dropped".into(), false);
    assert_eq!(rec.take(), vec![]);
}

#[test]
fn metadata_added_on_end_stream_headers_is_followed_by_empty_data_frame() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).on_headers(|f| f.add_decoded_metadata(meta("k", "m"))))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), true);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeHeaders { filter: "a", end_stream: true },
            Event::DecodeMetadata { filter: "a", metadata: meta("k", "m") },
            Event::DecodeHeaders { filter: "b", end_stream: false },
            Event::DecodeMetadata { filter: "b", metadata: meta("k", "m") },
            Event::DecodeData { filter: "b", data: Bytes::new(), end_stream: true },
            Event::DecodeComplete { filter: "b" },
        ]
    );
}

#[test]
fn trailers_stop_iteration_resumes_from_next_filter() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).trailers_status(FilterTrailersStatus::StopIteration))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.decode_trailers(HeaderMap::new());
    assert_eq!(
        rec.take(),
        vec![Event::DecodeTrailers { filter: "a" }, Event::DecodeComplete { filter: "a" }]
    );

    fm.continue_decoding(0);
    assert_eq!(
        rec.take(),
        vec![Event::DecodeTrailers { filter: "b" }, Event::DecodeComplete { filter: "b" }]
    );
}

#[test]
fn zero_byte_end_stream_resumes_after_stop_iteration_no_buffer() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).data_status(FilterDataStatus::StopIterationNoBuffer))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.decode_data(BodyBuffer::new(), true);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeData { filter: "a", data: Bytes::new(), end_stream: true },
            Event::DecodeComplete { filter: "a" },
        ]
    );

    fm.continue_decoding(0);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeData { filter: "b", data: Bytes::new(), end_stream: true },
            Event::DecodeComplete { filter: "b" },
        ]
    );
}

#[test]
fn data_added_during_trailers_is_inline_dispatched_to_later_filters() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).on_trailers(|f| f.add_decoded_data("x".into(), false).unwrap()))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.decode_trailers(HeaderMap::new());
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeTrailers { filter: "a" },
            Event::DecodeData { filter: "b", data: Bytes::from_static(b"x"), end_stream: false },
            Event::DecodeComplete { filter: "a" },
            Event::DecodeTrailers { filter: "b" },
            Event::DecodeComplete { filter: "b" },
        ]
    );
}

#[test]
fn encoder_trailer_callback_data_lands_before_trailers_at_sink() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .encoder(TestEncoder::new("a", &rec).on_trailers(|f| f.add_encoded_data("tail".into(), false).unwrap()))
        .encoder(TestEncoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), true);
    rec.take();

    fm.encode_headers(response_head(200), false);
    rec.take();

    fm.encode_trailers(HeaderMap::new());
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeTrailers { filter: "a" },
            Event::EncodeData { filter: "b", data: Bytes::from_static(b"tail"), end_stream: false },
            Event::SinkData { data: Bytes::from_static(b"tail"), end_stream: false },
            Event::EncodeComplete { filter: "a" },
            Event::EncodeTrailers { filter: "b" },
            Event::EncodeComplete { filter: "b" },
            Event::SinkTrailers,
            Event::SinkEndStream,
        ]
    );
}

#[test]
fn latest_data_filter_advances_through_a_full_sweep() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec))
        .decoder(TestDecoder::new("b", &rec))
        .decoder(TestDecoder::new("c", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    assert_eq!(fm.latest_data_decoding_filter, None);
    fm.decode_data("x".into(), false);
    assert_eq!(fm.latest_data_decoding_filter, Some(2));
}

// ---------------------------------------------------------------
// Flow control
// ---------------------------------------------------------------

#[test]
fn non_streaming_request_overflow_sends_payload_too_large() {
    let rec = Recorder::default();
    let config = HttpFilterChainConfig { buffer_limit: 4, ..HttpFilterChainConfig::default() };
    let (mut fm, _sink) = Harness::new(&rec)
        .config(config)
        .decoder(TestDecoder::new("a", &rec).data_status(FilterDataStatus::StopIterationAndBuffer))
        .encoder(TestEncoder::new("e", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.decode_data("exceeds!".into(), false);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeData { filter: "a", data: Bytes::from_static(b"exceeds!"), end_stream: false },
            Event::SinkRequestTooLarge,
            Event::EncodeHeaders { filter: "e", end_stream: false },
            Event::SinkHeaders { status: 413, end_stream: false },
            Event::EncodeData { filter: "e", data: Bytes::from_static(b"payload too large"), end_stream: true },
            Event::EncodeComplete { filter: "e" },
            Event::SinkData { data: Bytes::from_static(b"payload too large"), end_stream: true },
            Event::SinkEndStream,
        ]
    );
    assert_eq!(fm.stream_info().response_code(), Some(StatusCode::PAYLOAD_TOO_LARGE));
    assert_eq!(fm.stream_info().response_code_details(), Some(response_code_details::REQUEST_PAYLOAD_TOO_LARGE));

    // The response completed locally; later request body is dropped.
    fm.decode_data("more".into(), false);
    assert_eq!(rec.take(), vec![]);
}

#[test]
fn streaming_request_overflow_read_disables_downstream() {
    let rec = Recorder::default();
    let config = HttpFilterChainConfig { buffer_limit: 4, ..HttpFilterChainConfig::default() };
    let (mut fm, _sink) = Harness::new(&rec)
        .config(config)
        .decoder(TestDecoder::new("a", &rec).data_status(FilterDataStatus::StopIterationAndWatermark))
        .decoder(TestDecoder::new("b", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.decode_data("exceeds!".into(), true);
    assert_eq!(
        rec.take(),
        vec![
            Event::DecodeData { filter: "a", data: Bytes::from_static(b"exceeds!"), end_stream: true },
            Event::DecodeComplete { filter: "a" },
            Event::SinkDecoderAboveHigh,
        ]
    );

    fm.continue_decoding(0);
    assert_eq!(
        rec.take(),
        vec![
            Event::SinkDecoderBelowLow,
            Event::DecodeData { filter: "b", data: Bytes::from_static(b"exceeds!"), end_stream: true },
            Event::DecodeComplete { filter: "b" },
        ]
    );
}

#[test]
fn streaming_response_overflow_raises_and_lowers_watermarks() {
    let rec = Recorder::default();
    let probe = Arc::new(WatermarkProbe { rec: rec.clone() });
    let registered = Arc::clone(&probe);
    let config = HttpFilterChainConfig { buffer_limit: 4, ..HttpFilterChainConfig::default() };
    let (mut fm, _sink) = Harness::new(&rec)
        .config(config)
        .decoder(TestDecoder::new("r", &rec).on_headers(move |f| {
            f.add_downstream_watermark_callbacks(registered.clone());
        }))
        .encoder(TestEncoder::new("a", &rec).data_status(FilterDataStatus::StopIterationAndWatermark))
        .build();

    fm.decode_headers(request_head("/"), true);
    fm.encode_headers(response_head(200), false);
    rec.take();

    fm.encode_data("exceeds!".into(), true);
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeData { filter: "a", data: Bytes::from_static(b"exceeds!"), end_stream: true },
            Event::EncodeComplete { filter: "a" },
            Event::AboveHigh,
        ]
    );
    assert_eq!(fm.high_watermark_count(), 1);

    fm.continue_encoding(0);
    assert_eq!(
        rec.take(),
        vec![
            Event::BelowLow,
            Event::SinkData { data: Bytes::from_static(b"exceeds!"), end_stream: true },
            Event::SinkEndStream,
        ]
    );
    assert_eq!(fm.high_watermark_count(), 0);
}

#[test]
fn response_overflow_before_headers_sent_becomes_a_500() {
    let rec = Recorder::default();
    let config = HttpFilterChainConfig { buffer_limit: 4, ..HttpFilterChainConfig::default() };
    let (mut fm, _sink) = Harness::new(&rec)
        .config(config)
        .encoder(
            TestEncoder::new("a", &rec)
                .headers_status(FilterHeadersStatus::StopIteration)
                .on_headers(|f| f.add_encoded_data("too much data".into(), false).unwrap()),
        )
        .build();

    fm.decode_headers(request_head("/"), true);
    rec.take();

    fm.encode_headers(response_head(200), false);
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeHeaders { filter: "a", end_stream: false },
            Event::SinkResponseTooLarge,
            Event::SinkHeaders { status: 500, end_stream: false },
            Event::SinkData { data: Bytes::from_static(b"internal server error"), end_stream: true },
            Event::SinkEndStream,
        ]
    );
    assert_eq!(fm.stream_info().response_code_details(), Some(response_code_details::RESPONSE_PAYLOAD_TOO_LARGE));
}

#[test]
fn response_overflow_after_headers_sent_resets_the_stream() {
    let rec = Recorder::default();
    let config = HttpFilterChainConfig { buffer_limit: 4, ..HttpFilterChainConfig::default() };
    let (mut fm, sink) = Harness::new(&rec)
        .config(config)
        .encoder(TestEncoder::new("a", &rec).data_status(FilterDataStatus::StopIterationAndBuffer))
        .build();

    fm.decode_headers(request_head("/"), true);
    fm.encode_headers(response_head(200), false);
    rec.take();

    fm.encode_data("exceeds!".into(), false);
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeData { filter: "a", data: Bytes::from_static(b"exceeds!"), end_stream: false },
            Event::SinkResponseTooLarge,
            Event::SinkLocalReset,
        ]
    );
    assert!(fm.destroyed());
    assert_eq!(sink.cancel_timers.load(Ordering::Relaxed), 1);
}

// ---------------------------------------------------------------
// Filter protocol misuse
// ---------------------------------------------------------------

#[test]
fn trailer_synthesis_requires_last_data_frame() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).on_headers(|f| {
            assert_eq!(f.add_decoded_trailers().unwrap_err(), FilterChainError::TrailersOutsideLastDataFrame);
        }))
        .build();

    fm.decode_headers(request_head("/"), false);
}

#[test]
fn trailer_synthesis_happens_at_most_once() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).on_data(|f| {
            f.add_decoded_trailers().unwrap();
            assert_eq!(f.add_decoded_trailers().unwrap_err(), FilterChainError::TrailersAlreadyAdded);
        }))
        .build();

    fm.decode_headers(request_head("/"), false);
    fm.decode_data("x".into(), true);
}

#[test]
fn continuing_a_filter_that_never_stopped_is_a_no_op() {
    let rec = Recorder::default();
    let (mut fm, _sink) =
        Harness::new(&rec).decoder(TestDecoder::new("a", &rec)).decoder(TestDecoder::new("b", &rec)).build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.continue_decoding(0);
    fm.continue_decoding(1);
    // Out-of-range indices are rejected without effect as well.
    fm.continue_decoding(7);
    assert_eq!(rec.take(), vec![]);
}

// ---------------------------------------------------------------
// Upgrades
// ---------------------------------------------------------------

#[test]
fn accepted_upgrade_installs_the_upgrade_chain() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("default", &rec))
        .upgrade_decoder(TestDecoder::new("upgrade", &rec))
        .build();

    fm.decode_headers(upgrade_request_head(), true);
    assert!(fm.successful_upgrade());
    assert_eq!(
        rec.take(),
        vec![Event::SinkUpgrade, Event::DecodeHeaders { filter: "upgrade", end_stream: true }]
    );
}

#[test]
fn rejected_upgrade_replies_403_through_the_default_chain() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("d", &rec))
        .encoder(TestEncoder::new("e", &rec))
        .build();

    fm.decode_headers(upgrade_request_head(), true);
    assert!(!fm.successful_upgrade());
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeHeaders { filter: "e", end_stream: false },
            Event::SinkHeaders { status: 403, end_stream: false },
            Event::EncodeData { filter: "e", data: Bytes::from_static(b"upgrade failed"), end_stream: true },
            Event::EncodeComplete { filter: "e" },
            Event::SinkData { data: Bytes::from_static(b"upgrade failed"), end_stream: true },
            Event::SinkEndStream,
        ]
    );
    assert!(fm.stream_info().response_flags().contains(ResponseFlags::UPGRADE_FAILED));
    assert_eq!(fm.stream_info().response_code_details(), Some(response_code_details::UPGRADE_FAILED));
}

// ---------------------------------------------------------------
// Timeouts and teardown
// ---------------------------------------------------------------

#[test]
fn idle_timeout_before_response_synthesizes_a_408() {
    let rec = Recorder::default();
    let (mut fm, _sink) =
        Harness::new(&rec).decoder(TestDecoder::new("d", &rec)).encoder(TestEncoder::new("e", &rec)).build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.on_idle_timeout();
    assert_eq!(
        rec.take(),
        vec![
            Event::SinkIdleTimeout,
            Event::EncodeHeaders { filter: "e", end_stream: false },
            Event::SinkHeaders { status: 408, end_stream: false },
            Event::EncodeData { filter: "e", data: Bytes::from_static(b"stream timeout"), end_stream: true },
            Event::EncodeComplete { filter: "e" },
            Event::SinkData { data: Bytes::from_static(b"stream timeout"), end_stream: true },
            Event::SinkEndStream,
        ]
    );
    assert!(fm.stream_info().response_flags().contains(ResponseFlags::STREAM_IDLE_TIMEOUT));
}

#[test]
fn idle_timeout_after_response_headers_just_ends_the_stream() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec).encoder(TestEncoder::new("e", &rec)).build();

    fm.decode_headers(request_head("/"), true);
    fm.encode_headers(response_head(200), false);
    rec.take();

    fm.on_idle_timeout();
    assert_eq!(rec.take(), vec![Event::SinkIdleTimeout, Event::SinkEndStream]);
}

#[test]
fn request_timeout_synthesizes_a_408() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec).build();

    fm.decode_headers(request_head("/"), false);
    fm.on_request_timeout();
    assert_eq!(
        rec.take(),
        vec![
            Event::SinkRequestTimeout,
            Event::SinkHeaders { status: 408, end_stream: false },
            Event::SinkData { data: Bytes::from_static(b"request timeout"), end_stream: true },
            Event::SinkEndStream,
        ]
    );
    assert!(fm.stream_info().response_flags().contains(ResponseFlags::REQUEST_OVERALL_TIMEOUT));
}

#[test]
fn max_duration_ends_the_stream_through_the_codec() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec).build();

    fm.decode_headers(request_head("/"), false);
    fm.on_stream_max_duration_reached();
    assert_eq!(rec.take(), vec![Event::SinkMaxDuration, Event::SinkEndStream]);
}

#[test]
fn reset_makes_all_entries_no_ops() {
    let rec = Recorder::default();
    let (mut fm, sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("d", &rec))
        .encoder(TestEncoder::new("e", &rec))
        .build();

    fm.decode_headers(request_head("/"), false);
    rec.take();

    fm.reset_stream();
    assert_eq!(rec.take(), vec![Event::SinkLocalReset]);
    assert_eq!(sink.cancel_timers.load(Ordering::Relaxed), 1);
    assert!(fm.destroyed());

    fm.decode_data("late".into(), false);
    fm.decode_trailers(HeaderMap::new());
    fm.encode_headers(response_head(200), true);
    fm.on_idle_timeout();
    assert_eq!(rec.take(), vec![]);
}

// ---------------------------------------------------------------
// Stream recreation and routing
// ---------------------------------------------------------------

#[test]
fn recreate_stream_hands_headers_to_the_sink() {
    let rec = Recorder::default();
    let result = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&result);
    let (mut fm, _sink) = Harness::new(&rec)
        .accept_new_stream()
        .decoder(TestDecoder::new("a", &rec).on_headers(move |f| {
            *captured.lock() = Some(f.recreate_stream());
        }))
        .build();

    fm.decode_headers(request_head("/"), true);
    assert_eq!(*result.lock(), Some(true));
    assert!(fm.request_headers.is_none());
}

#[test]
fn recreate_stream_restores_headers_when_rejected() {
    let rec = Recorder::default();
    let result = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&result);
    let (mut fm, _sink) = Harness::new(&rec)
        .decoder(TestDecoder::new("a", &rec).on_headers(move |f| {
            *captured.lock() = Some(f.recreate_stream());
        }))
        .build();

    fm.decode_headers(request_head("/"), true);
    assert_eq!(*result.lock(), Some(false));
    assert!(fm.request_headers.is_some());
}

#[test]
fn recreate_stream_refuses_requests_with_a_body() {
    let rec = Recorder::default();
    let result = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&result);
    let (mut fm, _sink) = Harness::new(&rec)
        .accept_new_stream()
        .decoder(TestDecoder::new("a", &rec).on_data(move |f| {
            *captured.lock() = Some(f.recreate_stream());
        }))
        .build();

    fm.decode_headers(request_head("/"), false);
    fm.decode_data("x".into(), true);
    assert_eq!(*result.lock(), Some(false));
}

#[test]
fn route_is_cached_until_cleared() {
    let rec = Recorder::default();
    let cluster = Arc::new(ClusterInfo::new("backend"));
    let route = Arc::new(Route::new(Some(RouteEntry::new(Arc::clone(&cluster)))));
    let seen_cluster = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&seen_cluster);
    let (mut fm, sink) = Harness::new(&rec)
        .route(route)
        .decoder(TestDecoder::new("a", &rec).on_headers(move |f| {
            assert!(f.route().is_some());
            assert!(f.route().is_some());
            *captured.lock() = f.cluster_info().map(|c| c.name().to_string());
            f.clear_route_cache();
            assert!(f.route().is_some());
        }))
        .build();

    fm.decode_headers(request_head("/"), true);
    assert_eq!(sink.route_evaluations.load(Ordering::Relaxed), 2);
    assert_eq!(seen_cluster.lock().as_deref(), Some("backend"));
}

// ---------------------------------------------------------------
// Metadata on the encoder path
// ---------------------------------------------------------------

#[test]
fn encoder_metadata_flows_to_the_sink_after_headers() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec).encoder(TestEncoder::new("a", &rec)).build();

    fm.decode_headers(request_head("/"), true);
    fm.encode_headers(response_head(200), false);
    rec.take();

    fm.encode_metadata(meta("k", "v"));
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeMetadata { filter: "a", metadata: meta("k", "v") },
            Event::SinkMetadata { frames: 1 },
        ]
    );
}

#[test]
fn encoder_metadata_before_headers_is_deferred_until_headers_run() {
    let rec = Recorder::default();
    let (mut fm, _sink) = Harness::new(&rec).encoder(TestEncoder::new("a", &rec)).build();

    fm.decode_headers(request_head("/"), true);
    rec.take();

    fm.encode_metadata(meta("k", "v"));
    assert_eq!(rec.take(), vec![]);

    fm.encode_headers(response_head(200), true);
    assert_eq!(
        rec.take(),
        vec![
            Event::EncodeHeaders { filter: "a", end_stream: true },
            Event::EncodeComplete { filter: "a" },
            Event::EncodeMetadata { filter: "a", metadata: meta("k", "v") },
            Event::SinkMetadata { frames: 1 },
            Event::SinkHeaders { status: 200, end_stream: true },
            Event::SinkEndStream,
        ]
    );
}

// ---------------------------------------------------------------
// Header mutations
// ---------------------------------------------------------------

#[traced_test]
#[test]
fn header_mutations_from_every_filter_reach_the_sink() {
    let rec = Recorder::default();
    let (mut fm, sink) = Harness::new(&rec)
        .encoder(TestEncoder::new("a", &rec).on_headers(|f| {
            f.response_headers().unwrap().headers.insert("x-filter-a", HeaderValue::from_static("1"));
        }))
        .encoder(TestEncoder::new("b", &rec).on_headers(|f| {
            f.response_headers().unwrap().headers.insert("x-filter-b", HeaderValue::from_static("2"));
        }))
        .build();

    fm.decode_headers(request_head("/"), true);
    fm.encode_headers(response_head(200), true);

    let headers = sink.last_response_headers.lock().clone().unwrap();
    assert_eq!(headers.get("x-filter-a").unwrap(), "1");
    assert_eq!(headers.get("x-filter-b").unwrap(), "2");
}
