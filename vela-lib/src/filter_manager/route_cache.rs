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
use std::collections::HashMap;
use std::sync::Arc;

/// Upstream cluster facade. Resolution happens outside the chain; the
/// filters only ever see the already-selected cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    name: CompactString,
}

impl ClusterInfo {
    pub fn new(name: impl Into<CompactString>) -> Self {
        ClusterInfo { name: name.into() }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The routable part of a matched route.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    cluster: Arc<ClusterInfo>,
    upgrade_map: HashMap<CompactString, bool>,
}

impl RouteEntry {
    pub fn new(cluster: Arc<ClusterInfo>) -> Self {
        RouteEntry { cluster, upgrade_map: HashMap::new() }
    }

    #[must_use]
    pub fn with_upgrade(mut self, upgrade: impl Into<CompactString>, enabled: bool) -> Self {
        self.upgrade_map.insert(upgrade.into(), enabled);
        self
    }

    #[inline]
    pub fn cluster(&self) -> &Arc<ClusterInfo> {
        &self.cluster
    }

    #[inline]
    pub fn upgrade_map(&self) -> &HashMap<CompactString, bool> {
        &self.upgrade_map
    }
}

/// A matched route. Routes without an entry (e.g. direct responses)
/// carry `None`.
#[derive(Debug, Clone, Default)]
pub struct Route {
    route_entry: Option<RouteEntry>,
}

impl Route {
    pub fn new(route_entry: Option<RouteEntry>) -> Self {
        Route { route_entry }
    }

    #[inline]
    pub fn route_entry(&self) -> Option<&RouteEntry> {
        self.route_entry.as_ref()
    }
}

/// Handle to the route table a stream was matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfiguration {
    name: CompactString,
}

impl RouteConfiguration {
    pub fn new(name: impl Into<CompactString>) -> Self {
        RouteConfiguration { name: name.into() }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Cached route state: distinguishes "never evaluated" from
/// "evaluated and found nothing" so filters that clear the cache
/// force exactly one re-evaluation.
#[derive(Debug, Default)]
pub(crate) enum CachedRoute {
    #[default]
    NotComputed,
    Computed(Option<Arc<Route>>),
}

#[derive(Debug, Default)]
pub(crate) struct RouteCache {
    route: CachedRoute,
    cluster_info: Option<Arc<ClusterInfo>>,
}

impl RouteCache {
    pub(crate) fn is_computed(&self) -> bool {
        matches!(self.route, CachedRoute::Computed(_))
    }

    pub(crate) fn set(&mut self, route: Option<Arc<Route>>, cluster_info: Option<Arc<ClusterInfo>>) {
        self.route = CachedRoute::Computed(route);
        self.cluster_info = cluster_info;
    }

    pub(crate) fn clear(&mut self) {
        self.route = CachedRoute::NotComputed;
        self.cluster_info = None;
    }

    pub(crate) fn route(&self) -> Option<Arc<Route>> {
        match &self.route {
            CachedRoute::NotComputed => None,
            CachedRoute::Computed(route) => route.clone(),
        }
    }

    pub(crate) fn cluster_info(&self) -> Option<Arc<ClusterInfo>> {
        self.cluster_info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tri_state_transitions() {
        let mut cache = RouteCache::default();
        assert!(!cache.is_computed());
        assert!(cache.route().is_none());

        // Computed-but-empty is distinct from never computed.
        cache.set(None, None);
        assert!(cache.is_computed());
        assert!(cache.route().is_none());

        let cluster = Arc::new(ClusterInfo::new("backend"));
        let route = Arc::new(Route::new(Some(RouteEntry::new(Arc::clone(&cluster)))));
        cache.set(Some(route), Some(cluster));
        assert!(cache.is_computed());
        assert_eq!(cache.cluster_info().unwrap().name(), "backend");

        cache.clear();
        assert!(!cache.is_computed());
        assert!(cache.cluster_info().is_none());
    }

    #[test]
    fn upgrade_map_lookup() {
        let entry = RouteEntry::new(Arc::new(ClusterInfo::new("ws")))
            .with_upgrade("websocket", true)
            .with_upgrade("spdy", false);
        assert_eq!(entry.upgrade_map().get("websocket"), Some(&true));
        assert_eq!(entry.upgrade_map().get("spdy"), Some(&false));
        assert_eq!(entry.upgrade_map().get("h2c"), None);
    }
}
