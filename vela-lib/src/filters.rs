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
use crate::filter_manager::route_cache::{ClusterInfo, Route, RouteConfiguration};
use crate::metadata::MetadataMap;
use crate::sink::{ConnectionInfo, Dispatcher};
use crate::stream_info::StreamInfo;
use crate::{RequestHead, ResponseHead};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

/// Verdict of a headers callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    /// Hand the headers to the next filter.
    Continue,
    /// Halt this iteration; data/trailers may still be delivered.
    StopIteration,
    /// Continue the headers but force the direction into headers-only
    /// mode; any body or trailers are discarded.
    ContinueAndEndStream,
    /// Halt every frame type for this filter, buffering deferred data.
    StopAllIterationAndBuffer,
    /// Halt every frame type for this filter, buffering deferred data
    /// and raising watermarks instead of erroring on overflow.
    StopAllIterationAndWatermark,
}

/// Verdict of a data callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    Continue,
    StopIterationAndBuffer,
    StopIterationAndWatermark,
    StopIterationNoBuffer,
}

/// Verdict of a trailers callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
    StopIteration,
}

/// Verdict of a metadata callback. Metadata cannot pause iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMetadataStatus {
    Continue,
}

/// Filter protocol misuse surfaced back to the offending filter.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterChainError {
    #[error("trailers can only be added during the last data frame")]
    TrailersOutsideLastDataFrame,
    #[error("trailers were already added for this direction")]
    TrailersAlreadyAdded,
    #[error("data cannot be added in the current callback state")]
    AddDataInvalidCallState,
}

/// Registered by a filter (typically the router) to observe
/// downstream flow-control transitions on the response path.
pub trait DownstreamWatermarkCallbacks {
    fn on_above_write_buffer_high_watermark(&self);
    fn on_below_write_buffer_low_watermark(&self);
}

/// Surface handed to a decoder filter for the duration of one
/// callback. Request headers and trailers are reached through the
/// handle; transient frames (data, metadata) arrive as arguments.
pub trait DecoderFilterCallbacks {
    fn request_headers(&mut self) -> Option<&mut RequestHead>;
    fn request_trailers(&mut self) -> Option<&mut HeaderMap>;

    /// Adds body for later filters. Buffered or inline-dispatched
    /// depending on which callback is currently in flight.
    fn add_decoded_data(&mut self, data: BodyBuffer, streaming: bool) -> Result<(), FilterChainError>;
    /// Dispatches data to the filters after this one right now,
    /// re-using the stream's data path.
    fn inject_decoded_data_to_filter_chain(&mut self, data: BodyBuffer, end_stream: bool);
    /// Synthesizes request trailers. Only legal while the last data
    /// frame is being processed, and only once per stream.
    fn add_decoded_trailers(&mut self) -> Result<&mut HeaderMap, FilterChainError>;
    fn add_decoded_metadata(&mut self, metadata: MetadataMap);
    fn continue_decoding(&mut self);

    fn encode_100_continue_headers(&mut self, headers: ResponseHead);
    fn encode_headers(&mut self, headers: ResponseHead, end_stream: bool);
    fn encode_data(&mut self, data: BodyBuffer, end_stream: bool);
    fn encode_trailers(&mut self, trailers: HeaderMap);
    fn encode_metadata(&mut self, metadata: MetadataMap);

    #[allow(clippy::too_many_arguments)]
    fn send_local_reply(
        &mut self,
        code: StatusCode,
        body: &str,
        modify_headers: Option<Box<dyn FnOnce(&mut ResponseHead)>>,
        grpc_status: Option<u32>,
        details: &'static str,
    );

    fn stream_info(&mut self) -> &mut StreamInfo;
    fn connection(&self) -> Option<&ConnectionInfo>;
    fn dispatcher(&mut self) -> &mut dyn Dispatcher;
    fn active_span(&self) -> &tracing::Span;

    fn route(&mut self) -> Option<Arc<Route>>;
    fn cluster_info(&mut self) -> Option<Arc<ClusterInfo>>;
    fn clear_route_cache(&mut self);
    fn route_config(&mut self) -> Option<Arc<RouteConfiguration>>;
    fn request_route_config_update(&mut self, on_updated: Box<dyn FnOnce()>);

    fn decoder_buffer_limit(&self) -> u32;
    fn set_decoder_buffer_limit(&mut self, limit: u32);
    fn add_downstream_watermark_callbacks(&mut self, callbacks: Arc<dyn DownstreamWatermarkCallbacks>);
    fn remove_downstream_watermark_callbacks(&mut self, callbacks: &Arc<dyn DownstreamWatermarkCallbacks>);

    /// Takes the request headers and asks the stream owner for a
    /// brand-new stream. Refused when the request had a body.
    fn recreate_stream(&mut self) -> bool;
    fn reset_stream(&mut self);
}

/// Surface handed to an encoder filter for the duration of one
/// callback.
pub trait EncoderFilterCallbacks {
    fn response_headers(&mut self) -> Option<&mut ResponseHead>;
    fn response_trailers(&mut self) -> Option<&mut HeaderMap>;
    /// The pending 100-continue head, when one was received.
    fn continue_headers(&mut self) -> Option<&mut ResponseHead>;

    fn add_encoded_data(&mut self, data: BodyBuffer, streaming: bool) -> Result<(), FilterChainError>;
    fn inject_encoded_data_to_filter_chain(&mut self, data: BodyBuffer, end_stream: bool);
    fn add_encoded_trailers(&mut self) -> Result<&mut HeaderMap, FilterChainError>;
    fn add_encoded_metadata(&mut self, metadata: MetadataMap);
    fn continue_encoding(&mut self);

    fn stream_info(&mut self) -> &mut StreamInfo;
    fn connection(&self) -> Option<&ConnectionInfo>;
    fn dispatcher(&mut self) -> &mut dyn Dispatcher;
    fn active_span(&self) -> &tracing::Span;

    fn encoder_buffer_limit(&self) -> u32;
    fn set_encoder_buffer_limit(&mut self, limit: u32);
    fn reset_stream(&mut self);
}

/// A request-path filter. Every callback defaults to `Continue`, so a
/// passthrough filter is an empty `impl`.
pub trait DecoderFilter {
    fn decode_headers(&mut self, f: &mut dyn DecoderFilterCallbacks, end_stream: bool) -> FilterHeadersStatus {
        let _ = (f, end_stream);
        FilterHeadersStatus::Continue
    }

    fn decode_data(
        &mut self,
        f: &mut dyn DecoderFilterCallbacks,
        data: &mut BodyBuffer,
        end_stream: bool,
    ) -> FilterDataStatus {
        let _ = (f, data, end_stream);
        FilterDataStatus::Continue
    }

    fn decode_trailers(&mut self, f: &mut dyn DecoderFilterCallbacks) -> FilterTrailersStatus {
        let _ = f;
        FilterTrailersStatus::Continue
    }

    fn decode_metadata(&mut self, f: &mut dyn DecoderFilterCallbacks, metadata: &mut MetadataMap) -> FilterMetadataStatus {
        let _ = (f, metadata);
        FilterMetadataStatus::Continue
    }

    /// The request reached this filter in full: the callback carrying
    /// `end_stream = true` has returned.
    fn decode_complete(&mut self) {}

    fn on_destroy(&mut self) {}
}

/// A response-path filter. Every callback defaults to `Continue`.
pub trait EncoderFilter {
    fn encode_100_continue_headers(&mut self, f: &mut dyn EncoderFilterCallbacks) -> FilterHeadersStatus {
        let _ = f;
        FilterHeadersStatus::Continue
    }

    fn encode_headers(&mut self, f: &mut dyn EncoderFilterCallbacks, end_stream: bool) -> FilterHeadersStatus {
        let _ = (f, end_stream);
        FilterHeadersStatus::Continue
    }

    fn encode_data(
        &mut self,
        f: &mut dyn EncoderFilterCallbacks,
        data: &mut BodyBuffer,
        end_stream: bool,
    ) -> FilterDataStatus {
        let _ = (f, data, end_stream);
        FilterDataStatus::Continue
    }

    fn encode_trailers(&mut self, f: &mut dyn EncoderFilterCallbacks) -> FilterTrailersStatus {
        let _ = f;
        FilterTrailersStatus::Continue
    }

    fn encode_metadata(&mut self, f: &mut dyn EncoderFilterCallbacks, metadata: &mut MetadataMap) -> FilterMetadataStatus {
        let _ = (f, metadata);
        FilterMetadataStatus::Continue
    }

    fn encode_complete(&mut self) {}

    fn on_destroy(&mut self) {}
}
