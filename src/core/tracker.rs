//! Bookkeeping for in-flight update checks.
//!
//! A check is done once two gates are clear: no extension is still waiting on
//! a download outcome, and the batched update-service call (if one was made)
//! has answered. The entry is erased and its callback run the moment both
//! hold, so a callback can never fire twice.

use crate::core::model::{CompletionCallback, ExtensionId, RequestId};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error};

pub struct InProgressCheck {
    requested: Vec<ExtensionId>,
    in_progress_ids: BTreeSet<ExtensionId>,
    awaiting_external_service: bool,
    install_immediately: bool,
    callback: Option<CompletionCallback>,
}

impl InProgressCheck {
    fn is_done(&self) -> bool {
        self.in_progress_ids.is_empty() && !self.awaiting_external_service
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSnapshot {
    pub request_id: RequestId,
    pub requested: Vec<ExtensionId>,
    pub in_progress_ids: Vec<ExtensionId>,
    pub awaiting_external_service: bool,
    pub install_immediately: bool,
}

pub struct RequestTracker {
    next_request_id: RequestId,
    requests: HashMap<RequestId, InProgressCheck>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self { next_request_id: 1, requests: HashMap::new() }
    }

    /// The id the next `begin_request` will hand out.
    pub fn next_request_id(&self) -> RequestId {
        self.next_request_id
    }

    /// `ids` is what the caller asked for; it does not seed the in-progress set.
    pub fn begin_request(
        &mut self,
        ids: &[ExtensionId],
        install_immediately: bool,
        callback: Option<CompletionCallback>,
    ) -> RequestId {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.insert(
            request_id,
            InProgressCheck {
                requested: ids.to_vec(),
                in_progress_ids: BTreeSet::new(),
                awaiting_external_service: false,
                install_immediately,
                callback,
            },
        );
        request_id
    }

    pub fn mark_extension_pending(&mut self, request_id: RequestId, extension_id: &str) {
        if let Some(check) = self.expect_open(request_id, "mark_extension_pending") {
            check.in_progress_ids.insert(extension_id.to_string());
        }
    }

    /// Returns true if this call completed the check.
    pub fn mark_extension_resolved(&mut self, request_id: RequestId, extension_id: &str) -> bool {
        match self.requests.get_mut(&request_id) {
            Some(check) => {
                check.in_progress_ids.remove(extension_id);
            }
            None => {
                debug!(request_id, extension_id, "resolve for a check that already finished");
                return false;
            }
        }
        self.resolve_if_finished(request_id)
    }

    pub fn mark_external_service_pending(&mut self, request_id: RequestId) {
        if let Some(check) = self.expect_open(request_id, "mark_external_service_pending") {
            check.awaiting_external_service = true;
        }
    }

    pub fn mark_external_service_resolved(&mut self, request_id: RequestId) -> bool {
        match self.requests.get_mut(&request_id) {
            Some(check) => check.awaiting_external_service = false,
            None => {
                debug!(request_id, "update service answered a check that already finished");
                return false;
            }
        }
        self.resolve_if_finished(request_id)
    }

    /// Erases the check and runs its callback if both gates are clear.
    /// Safe to call any number of times.
    pub fn resolve_if_finished(&mut self, request_id: RequestId) -> bool {
        match self.requests.get(&request_id) {
            Some(check) if check.is_done() => {}
            _ => return false,
        }
        if let Some(mut check) = self.requests.remove(&request_id) {
            debug!(request_id, "finished update check");
            if let Some(cb) = check.callback.take() {
                cb();
            }
        }
        true
    }

    pub fn install_immediately(&self, request_id: RequestId) -> bool {
        self.requests.get(&request_id).map(|c| c.install_immediately).unwrap_or(false)
    }

    pub fn has_pending_extensions(&self, request_id: RequestId) -> bool {
        self.requests.get(&request_id).map(|c| !c.in_progress_ids.is_empty()).unwrap_or(false)
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.requests.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn snapshot(&self) -> Vec<CheckSnapshot> {
        let mut out: Vec<CheckSnapshot> = self
            .requests
            .iter()
            .map(|(id, c)| CheckSnapshot {
                request_id: *id,
                requested: c.requested.clone(),
                in_progress_ids: c.in_progress_ids.iter().cloned().collect(),
                awaiting_external_service: c.awaiting_external_service,
                install_immediately: c.install_immediately,
            })
            .collect();
        out.sort_by_key(|s| s.request_id);
        out
    }

    /// Drops every open check without running callbacks.
    pub fn abandon_all(&mut self) -> usize {
        let n = self.requests.len();
        self.requests.clear();
        n
    }

    fn expect_open(&mut self, request_id: RequestId, op: &'static str) -> Option<&mut InProgressCheck> {
        let found = self.requests.get_mut(&request_id);
        if found.is_none() {
            error!(request_id, op, "no such update check");
            debug_assert!(false, "{op} on unknown update check {request_id}");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, CompletionCallback) {
        let c = Arc::new(AtomicUsize::new(0));
        let c2 = c.clone();
        (c, Box::new(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let mut t = RequestTracker::new();
        let a = t.begin_request(&[], false, None);
        let b = t.begin_request(&[], false, None);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(t.resolve_if_finished(a));
        let c = t.begin_request(&[], false, None);
        assert_eq!(c, 3);
    }

    #[test]
    fn empty_request_resolves_on_check() {
        let mut t = RequestTracker::new();
        let (hits, cb) = counter();
        let id = t.begin_request(&[], false, Some(cb));
        assert_eq!(id, 1);
        assert!(t.resolve_if_finished(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn single_extension_fires_once() {
        let mut t = RequestTracker::new();
        let (hits, cb) = counter();
        let id = t.begin_request(&["ext-A".to_string()], false, Some(cb));
        t.mark_extension_pending(id, "ext-A");
        assert!(!t.resolve_if_finished(id));
        assert!(t.mark_extension_resolved(id, "ext-A"));
        assert!(!t.mark_extension_resolved(id, "ext-A"));
        assert!(!t.resolve_if_finished(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn both_gates_required_extension_first() {
        let mut t = RequestTracker::new();
        let (hits, cb) = counter();
        let id = t.begin_request(&[], false, Some(cb));
        t.mark_extension_pending(id, "ext-A");
        t.mark_external_service_pending(id);

        assert!(!t.mark_extension_resolved(id, "ext-A"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(t.mark_external_service_resolved(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!t.mark_external_service_resolved(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn both_gates_required_service_first() {
        let mut t = RequestTracker::new();
        let (hits, cb) = counter();
        let id = t.begin_request(&[], false, Some(cb));
        t.mark_extension_pending(id, "ext-A");
        t.mark_external_service_pending(id);

        assert!(!t.mark_external_service_resolved(id));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(t.mark_extension_resolved(id, "ext-A"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_extension_is_noop() {
        let mut t = RequestTracker::new();
        let (hits, cb) = counter();
        let id = t.begin_request(&[], false, Some(cb));
        t.mark_extension_pending(id, "ext-A");
        assert!(!t.mark_extension_resolved(id, "ext-B"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(t.contains(id));
    }

    #[test]
    fn shared_extension_resolves_each_request_independently() {
        let mut t = RequestTracker::new();
        let (h1, cb1) = counter();
        let (h2, cb2) = counter();
        let r1 = t.begin_request(&[], false, Some(cb1));
        let r2 = t.begin_request(&[], false, Some(cb2));
        t.mark_extension_pending(r1, "E");
        t.mark_extension_pending(r2, "E");
        t.mark_extension_pending(r2, "F");

        for r in [r1, r2] {
            t.mark_extension_resolved(r, "E");
        }
        assert_eq!(h1.load(Ordering::SeqCst), 1);
        assert_eq!(h2.load(Ordering::SeqCst), 0);

        t.mark_extension_resolved(r2, "F");
        assert_eq!(h2.load(Ordering::SeqCst), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn abandon_drops_without_callbacks() {
        let mut t = RequestTracker::new();
        let (hits, cb) = counter();
        let id = t.begin_request(&[], true, Some(cb));
        t.mark_extension_pending(id, "ext-A");
        assert!(t.install_immediately(id));
        assert_eq!(t.abandon_all(), 1);
        assert!(!t.mark_extension_resolved(id, "ext-A"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!t.install_immediately(id));
    }

    #[test]
    fn snapshot_lists_open_checks_in_order() {
        let mut t = RequestTracker::new();
        let a = t.begin_request(&["x".to_string()], false, None);
        let b = t.begin_request(&[], true, None);
        t.mark_extension_pending(a, "x");
        t.mark_external_service_pending(b);
        let snap = t.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].request_id, a);
        assert_eq!(snap[0].in_progress_ids, vec!["x".to_string()]);
        assert!(snap[1].awaiting_external_service);
        assert!(snap[1].install_immediately);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unknown update check")]
    fn marking_unknown_request_is_fatal_in_debug() {
        let mut t = RequestTracker::new();
        t.mark_extension_pending(99, "ext-A");
    }
}
