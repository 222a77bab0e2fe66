// Copyright 2025 The vela Authors
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

//! Per-stream HTTP filter chain: the state machine that drives a
//! bidirectional pipeline of pluggable filters over one HTTP
//! request/response exchange, with asynchronous continuation,
//! buffering, watermark propagation, metadata queuing and trailer
//! synthesis. Wire codecs, routing and upstream management live
//! behind the narrow traits in [`sink`].

pub mod body;
pub mod filter_manager;
pub mod filters;
pub mod metadata;
pub mod sink;
pub mod stream_info;

/// Mutable request head flowing through the decoder chain.
pub type RequestHead = http::request::Parts;
/// Mutable response head flowing through the encoder chain.
pub type ResponseHead = http::response::Parts;

pub type Error = FilterChainError;
pub type Result<T> = ::core::result::Result<T, Error>;

pub use body::{BodyBuffer, WatermarkBuffer, WatermarkChange};
pub use filter_manager::local_reply::{LocalReplyFormatter, LocalReplySpec, PlainTextFormatter};
pub use filter_manager::route_cache::{ClusterInfo, Route, RouteConfiguration, RouteEntry};
pub use filter_manager::{FilterCallState, FilterIterationStartState, FilterManager, FilterManagerBuilder};
pub use filters::{
    DecoderFilter, DecoderFilterCallbacks, DownstreamWatermarkCallbacks, EncoderFilter, EncoderFilterCallbacks,
    FilterChainError, FilterDataStatus, FilterHeadersStatus, FilterMetadataStatus, FilterTrailersStatus,
};
pub use metadata::{MetadataMap, MetadataQueue};
pub use sink::{
    ConnectionInfo, CustomTagMap, Dispatcher, FilterChainBuilder, FilterChainFactory, InlineDispatcher,
    RouteConfigProvider, StreamSink,
};
pub use stream_info::{response_code_details, ResponseFlags, StreamInfo};
pub use vela_configuration::HttpFilterChainConfig;
