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
use crate::ResponseHead;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Response, StatusCode};

/// Everything needed to synthesize a proxy-generated response.
#[derive(Debug)]
pub struct LocalReplySpec<'a> {
    pub code: StatusCode,
    pub body: &'a str,
    pub grpc_status: Option<u32>,
    pub details: &'static str,
    pub is_head_request: bool,
    pub is_grpc_request: bool,
}

/// Renders a [`LocalReplySpec`] into a response head and body. The
/// formatter is supplied by the embedder; [`PlainTextFormatter`] is
/// the default.
pub trait LocalReplyFormatter {
    fn format(&self, spec: &LocalReplySpec<'_>) -> (ResponseHead, BodyBuffer);
}

/// Text/plain local replies, with the gRPC translation applied when
/// the downstream request was gRPC: a 200 head carrying
/// `grpc-status` / `grpc-message` and no payload.
#[derive(Debug, Default)]
pub struct PlainTextFormatter;

impl LocalReplyFormatter for PlainTextFormatter {
    fn format(&self, spec: &LocalReplySpec<'_>) -> (ResponseHead, BodyBuffer) {
        if spec.is_grpc_request {
            let mut head = response_head(StatusCode::OK);
            head.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
            let grpc_status = spec.grpc_status.unwrap_or_else(|| http_status_to_grpc(spec.code));
            head.headers.insert("grpc-status", HeaderValue::from(grpc_status));
            if !spec.body.is_empty() {
                head.headers.insert(
                    "grpc-message",
                    HeaderValue::try_from(spec.body).unwrap_or_else(|_| HeaderValue::from_static("")),
                );
            }
            return (head, BodyBuffer::new());
        }

        let mut head = response_head(spec.code);
        let mut body = BodyBuffer::new();
        if !spec.body.is_empty() {
            head.headers.insert(CONTENT_LENGTH, HeaderValue::from(spec.body.len() as u64));
            head.headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            // HEAD requests keep the descriptive headers but not the
            // payload itself.
            if !spec.is_head_request {
                body.add(Bytes::copy_from_slice(spec.body.as_bytes()));
            }
        }
        (head, body)
    }
}

fn response_head(code: StatusCode) -> ResponseHead {
    let (mut head, ()) = Response::new(()).into_parts();
    head.status = code;
    head
}

/// The subset of the gRPC status space local replies map onto.
fn http_status_to_grpc(code: StatusCode) -> u32 {
    match code {
        StatusCode::BAD_REQUEST => 13,          // internal
        StatusCode::UNAUTHORIZED => 16,         // unauthenticated
        StatusCode::FORBIDDEN => 7,             // permission denied
        StatusCode::NOT_FOUND => 12,            // unimplemented
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => 14,    // unavailable
        _ => 2,                                 // unknown
    }
}
