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

use serde::{Deserialize, Serialize};

/// Per-stream settings for the HTTP filter chain.
///
/// `buffer_limit` is the high watermark of each direction's buffered
/// body; the low watermark is derived from it. The headers-only flags
/// are usually flipped at runtime by a filter returning
/// `ContinueAndEndStream`, but may also be forced up front.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct HttpFilterChainConfig {
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: u32,
    #[serde(default)]
    pub proxy_100_continue: bool,
    #[serde(default)]
    pub is_head_request: bool,
    #[serde(default)]
    pub decoding_headers_only: bool,
    #[serde(default)]
    pub encoding_headers_only: bool,
}

impl Default for HttpFilterChainConfig {
    fn default() -> Self {
        HttpFilterChainConfig {
            buffer_limit: default_buffer_limit(),
            proxy_100_continue: false,
            is_head_request: false,
            decoding_headers_only: false,
            encoding_headers_only: false,
        }
    }
}

fn default_buffer_limit() -> u32 {
    65536
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HttpFilterChainConfig::default();
        assert_eq!(config.buffer_limit, 65536);
        assert!(!config.proxy_100_continue);
        assert!(!config.is_head_request);
        assert!(!config.decoding_headers_only);
        assert!(!config.encoding_headers_only);
    }

    #[test]
    fn deserialize_partial_yaml() {
        let config: HttpFilterChainConfig =
            serde_yaml::from_str("buffer_limit: 1024\nproxy_100_continue: true\n").unwrap();
        assert_eq!(config.buffer_limit, 1024);
        assert!(config.proxy_100_continue);
        assert!(!config.is_head_request);
    }

    #[test]
    fn deserialize_empty_yaml_uses_defaults() {
        let config: HttpFilterChainConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, HttpFilterChainConfig::default());
    }
}
