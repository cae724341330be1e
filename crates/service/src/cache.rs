//! Per-device cache of system query answers.
//!
//! Device name, application name and feature support rarely change while a
//! device stays connected, so the router answers repeated system queries
//! locally. Negative feature answers are never cached; the device may
//! install the feature later.

use std::collections::{HashMap, HashSet};

use companion_protocol::messages::from_msgpack;
use companion_protocol::{Query, QueryResponse, SystemQuery, SystemQueryType, SYSTEM_FEATURE_ID};
use dashmap::DashMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// A system query whose answer can be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachedQuery {
    DeviceName,
    AppName,
    FeatureSupported(Uuid),
}

impl CachedQuery {
    /// Classifies a query addressed to the system feature.
    pub fn from_query(query: &Query) -> Option<Self> {
        let system: SystemQuery = from_msgpack(&query.request).ok()?;
        match system.query_type {
            SystemQueryType::DeviceName => Some(Self::DeviceName),
            SystemQueryType::AppName => Some(Self::AppName),
            SystemQueryType::IsFeatureSupported => {
                let feature = system.payloads.first()?;
                Uuid::from_slice(feature).ok().map(Self::FeatureSupported)
            }
            SystemQueryType::Unknown => None,
        }
    }
}

#[derive(Debug, Default)]
struct DeviceCache {
    device_name: Option<Vec<u8>>,
    app_name: Option<Vec<u8>>,
    supported_features: HashSet<Uuid>,
    /// Outstanding queries keyed by `(sender, query id)`.
    pending: HashMap<(Uuid, i32), CachedQuery>,
}

impl DeviceCache {
    fn is_empty(&self) -> bool {
        self.device_name.is_none()
            && self.app_name.is_none()
            && self.supported_features.is_empty()
            && self.pending.is_empty()
    }

    fn lookup(&self, query: CachedQuery) -> Option<Vec<u8>> {
        match query {
            CachedQuery::DeviceName => self.device_name.clone(),
            CachedQuery::AppName => self.app_name.clone(),
            CachedQuery::FeatureSupported(feature) => self
                .supported_features
                .contains(&feature)
                .then(|| vec![1]),
        }
    }
}

/// Caches system query responses per device.
#[derive(Debug, Default)]
pub struct ResponseCache {
    devices: DashMap<Uuid, DeviceCache>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles a query about to be sent to `device_id`.
    ///
    /// Returns a locally built response when the answer is cached. Otherwise
    /// the query is tracked so its response can be cached, and `None` is
    /// returned.
    pub fn on_outbound_query(
        &self,
        device_id: Uuid,
        recipient: Uuid,
        query: &Query,
    ) -> Option<QueryResponse> {
        if recipient != SYSTEM_FEATURE_ID {
            return None;
        }
        let kind = CachedQuery::from_query(query)?;

        let mut cache = self.devices.entry(device_id).or_default();
        if let Some(answer) = cache.lookup(kind) {
            debug!(%device_id, query = ?kind, "Answering system query from cache");
            return Some(QueryResponse {
                query_id: query.id,
                success: true,
                response: Some(answer),
            });
        }

        trace!(%device_id, query_id = query.id, query = ?kind, "Tracking system query");
        cache.pending.insert((query.sender, query.id), kind);
        None
    }

    /// Records the response to a tracked query. `sender` is the feature that
    /// sent the query.
    pub fn on_query_response(&self, device_id: Uuid, sender: Uuid, response: &QueryResponse) {
        let Some(mut cache) = self.devices.get_mut(&device_id) else {
            return;
        };
        let Some(kind) = cache.pending.remove(&(sender, response.query_id)) else {
            warn!(%device_id, query_id = response.query_id, "Response to untracked query");
            return;
        };

        if !response.success {
            debug!(%device_id, query = ?kind, "Query failed, not caching");
            return;
        }
        let Some(answer) = response.response.clone() else {
            return;
        };

        match kind {
            CachedQuery::DeviceName => cache.device_name = Some(answer),
            CachedQuery::AppName => cache.app_name = Some(answer),
            CachedQuery::FeatureSupported(feature) => {
                if answer.first().is_some_and(|flag| *flag != 0) {
                    cache.supported_features.insert(feature);
                }
            }
        }
        debug!(%device_id, query = ?kind, "Cached system query response");
    }

    /// Returns the cached answer for `query`, if any.
    pub fn cached(&self, device_id: &Uuid, query: CachedQuery) -> Option<Vec<u8>> {
        self.devices.get(device_id)?.lookup(query)
    }

    pub fn device_name(&self, device_id: &Uuid) -> Option<String> {
        self.cached(device_id, CachedQuery::DeviceName)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Whether a response is expected for `(sender, query_id)`.
    pub fn is_tracking(
        &self,
        device_id: &Uuid,
        sender: Uuid,
        query_id: i32,
    ) -> Option<CachedQuery> {
        self.devices
            .get(device_id)?
            .pending
            .get(&(sender, query_id))
            .copied()
    }

    /// Forgets a tracked query whose request never reached the device.
    pub fn untrack(&self, device_id: &Uuid, sender: Uuid, query_id: i32) {
        let removed = self
            .devices
            .get_mut(device_id)
            .and_then(|mut cache| cache.pending.remove(&(sender, query_id)));
        if removed.is_some() {
            trace!(%device_id, query_id, "Stopped tracking system query");
            self.devices.remove_if(device_id, |_, cache| cache.is_empty());
        }
    }

    /// Number of devices with cached answers or pending queries.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Drops everything known about a device.
    pub fn clear(&self, device_id: &Uuid) {
        if self.devices.remove(device_id).is_some() {
            debug!(%device_id, "Response cache cleared");
        }
    }

    /// Seeds the cache. Used by tests and by callers that learn the
    /// answer out of band.
    pub fn insert(&self, device_id: Uuid, query: CachedQuery, answer: Vec<u8>) {
        let mut cache = self.devices.entry(device_id).or_default();
        match query {
            CachedQuery::DeviceName => cache.device_name = Some(answer),
            CachedQuery::AppName => cache.app_name = Some(answer),
            CachedQuery::FeatureSupported(feature) => {
                cache.supported_features.insert(feature);
            }
        }
    }
}
