//! Arena of live subscriptions with lookups by SID and by owning device.
//!
//! The index itself is not synchronised; the manager keeps it behind a
//! `tokio::sync::RwLock` so every structural change happens under one write
//! guard.

use std::collections::HashMap;

use crate::subscription::Subscription;
use crate::types::{DeviceId, ServiceKey, Sid, SubscriptionHandle, SubscriptionStatus};

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    /// Owning storage
    arena: HashMap<SubscriptionHandle, Subscription>,

    /// Only subscriptions whose SID is known
    by_id: HashMap<Sid, SubscriptionHandle>,

    /// Every live subscription, bucketed by the service's owning device
    by_device: HashMap<DeviceId, Vec<SubscriptionHandle>>,

    /// Terminal state of services whose subscription has been pruned
    outcomes: HashMap<ServiceKey, SubscriptionStatus>,

    next_handle: u64,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle that has never been used before.
    pub fn allocate_handle(&mut self) -> SubscriptionHandle {
        self.next_handle += 1;
        SubscriptionHandle::new(self.next_handle)
    }

    /// Add a new subscription. Any recorded outcome for its service is
    /// replaced by the live entry.
    pub fn insert(&mut self, subscription: Subscription) {
        let handle = subscription.handle();
        let key = subscription.key().clone();

        self.outcomes.remove(&key);
        self.by_device
            .entry(key.device_id)
            .or_default()
            .push(handle);
        self.arena.insert(handle, subscription);
    }

    pub fn get(&self, handle: SubscriptionHandle) -> Option<&Subscription> {
        self.arena.get(&handle)
    }

    pub fn get_mut(&mut self, handle: SubscriptionHandle) -> Option<&mut Subscription> {
        self.arena.get_mut(&handle)
    }

    /// The live subscription for a service, if any.
    pub fn find_by_service(&self, key: &ServiceKey) -> Option<SubscriptionHandle> {
        self.by_device.get(&key.device_id).and_then(|bucket| {
            bucket
                .iter()
                .copied()
                .find(|handle| self.arena.get(handle).is_some_and(|s| s.key() == key))
        })
    }

    pub fn find_by_sid(&self, sid: &Sid) -> Option<SubscriptionHandle> {
        self.by_id.get(sid).copied()
    }

    /// Make a subscription reachable by its SID. Called once the remote
    /// service has granted one.
    pub fn index_sid(&mut self, handle: SubscriptionHandle) {
        if let Some(sid) = self.arena.get(&handle).and_then(|s| s.sid()).cloned() {
            self.by_id.insert(sid, handle);
        }
    }

    /// Live handles belonging to `device`'s own services.
    pub fn handles_for_device(&self, device: &DeviceId) -> Vec<SubscriptionHandle> {
        self.by_device.get(device).cloned().unwrap_or_default()
    }

    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        self.arena.keys().copied().collect()
    }

    /// Drop a terminal subscription from every mapping, remembering how it
    /// ended so status queries can report it.
    pub fn prune(&mut self, handle: SubscriptionHandle) -> Option<Subscription> {
        let subscription = self.detach(handle)?;
        let status = subscription.status();
        if matches!(
            status,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Failed
        ) {
            self.outcomes.insert(subscription.key().clone(), status);
        }
        Some(subscription)
    }

    /// Forget a service entirely: its live subscription and any recorded
    /// outcome. Returns true if anything was removed.
    pub fn remove_service(&mut self, key: &ServiceKey) -> bool {
        let live = self
            .find_by_service(key)
            .and_then(|handle| self.detach(handle))
            .is_some();
        let outcome = self.outcomes.remove(key).is_some();
        live || outcome
    }

    /// Forget every service of `device`. Returns true if anything was removed.
    pub fn remove_device(&mut self, device: &DeviceId) -> bool {
        let handles = self.by_device.remove(device).unwrap_or_default();
        let mut removed = false;
        for handle in handles {
            if let Some(subscription) = self.arena.remove(&handle) {
                if let Some(sid) = subscription.sid() {
                    self.by_id.remove(sid);
                }
                removed = true;
            }
        }

        let before = self.outcomes.len();
        self.outcomes.retain(|key, _| &key.device_id != device);
        removed || self.outcomes.len() != before
    }

    /// Forget everything. Returns the number of live subscriptions dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.arena.len();
        self.arena.clear();
        self.by_id.clear();
        self.by_device.clear();
        self.outcomes.clear();
        count
    }

    /// Live state of a service, else its recorded outcome, else
    /// `Unsubscribed`.
    pub fn status(&self, key: &ServiceKey) -> SubscriptionStatus {
        self.find_by_service(key)
            .and_then(|handle| self.arena.get(&handle))
            .map(|s| s.status())
            .or_else(|| self.outcomes.get(key).copied())
            .unwrap_or(SubscriptionStatus::Unsubscribed)
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Number of subscriptions reachable by SID.
    pub fn sid_count(&self) -> usize {
        self.by_id.len()
    }

    fn detach(&mut self, handle: SubscriptionHandle) -> Option<Subscription> {
        let subscription = self.arena.remove(&handle)?;

        if let Some(sid) = subscription.sid() {
            if self.by_id.get(sid) == Some(&handle) {
                self.by_id.remove(sid);
            }
        }

        let device = &subscription.key().device_id;
        if let Some(bucket) = self.by_device.get_mut(device) {
            bucket.retain(|h| *h != handle);
            if bucket.is_empty() {
                self.by_device.remove(device);
            }
        }

        Some(subscription)
    }

    /// Check the cross-mapping invariants. Test builds only.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (sid, handle) in &self.by_id {
            let subscription = self.arena.get(handle).expect("by_id handle missing from arena");
            assert_eq!(subscription.sid(), Some(sid));
            let bucket = &self.by_device[&subscription.key().device_id];
            assert_eq!(bucket.iter().filter(|h| *h == handle).count(), 1);
        }
        let mut bucketed = 0;
        for (device, bucket) in &self.by_device {
            for handle in bucket {
                let subscription = self.arena.get(handle).expect("bucket handle missing from arena");
                assert_eq!(&subscription.key().device_id, device);
                assert!(matches!(
                    subscription.status(),
                    SubscriptionStatus::Subscribing
                        | SubscriptionStatus::Subscribed
                        | SubscriptionStatus::Renewing
                        | SubscriptionStatus::Unsubscribing
                ));
                bucketed += 1;
            }
        }
        assert_eq!(bucketed, self.arena.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceProxy;
    use crate::notify::StateVariableChange;
    use crate::transport::SubscribeGrant;
    use crate::types::Timeout;
    use std::sync::Arc;
    use tokio::time::Instant;
    use url::Url;

    struct Service(ServiceKey);

    impl ServiceProxy for Service {
        fn key(&self) -> ServiceKey {
            self.0.clone()
        }

        fn is_evented(&self) -> bool {
            true
        }

        fn event_sub_url(&self) -> Url {
            Url::parse("http://192.168.1.10:1400/event").unwrap()
        }

        fn device_locations(&self) -> Vec<Url> {
            Vec::new()
        }

        fn on_state_changes(&self, _changes: &[StateVariableChange]) {}
    }

    fn service(device: &str, id: &str) -> Arc<dyn ServiceProxy> {
        Arc::new(Service(ServiceKey::new(device, id)))
    }

    fn subscribing(index: &mut SubscriptionIndex, service: &Arc<dyn ServiceProxy>) -> SubscriptionHandle {
        let handle = index.allocate_handle();
        let mut subscription = Subscription::new(handle, service, Timeout::default());
        subscription
            .begin_subscribe(Url::parse("http://10.0.0.2:3400/notify/1").unwrap())
            .unwrap();
        index.insert(subscription);
        handle
    }

    fn subscribed(
        index: &mut SubscriptionIndex,
        service: &Arc<dyn ServiceProxy>,
        sid: &str,
    ) -> SubscriptionHandle {
        let handle = subscribing(index, service);
        index
            .get_mut(handle)
            .unwrap()
            .on_subscribed(
                SubscribeGrant {
                    sid: Sid::new(sid),
                    timeout: Timeout::Seconds(1800),
                },
                Instant::now(),
            )
            .unwrap();
        index.index_sid(handle);
        handle
    }

    #[test]
    fn test_handles_are_never_reused() {
        let mut index = SubscriptionIndex::new();
        let a = index.allocate_handle();
        let b = index.allocate_handle();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_pending_subscription_not_indexed_by_sid() {
        let mut index = SubscriptionIndex::new();
        let svc = service("uuid:a", "s1");
        let handle = subscribing(&mut index, &svc);

        assert_eq!(index.find_by_service(&svc.key()), Some(handle));
        assert_eq!(index.sid_count(), 0);
        assert_eq!(index.status(&svc.key()), SubscriptionStatus::Subscribing);
        index.assert_consistent();
    }

    #[test]
    fn test_subscribed_indexed_by_sid_and_device() {
        let mut index = SubscriptionIndex::new();
        let s1 = service("uuid:a", "s1");
        let s2 = service("uuid:a", "s2");
        let h1 = subscribed(&mut index, &s1, "uuid:sid-1");
        let h2 = subscribed(&mut index, &s2, "uuid:sid-2");

        assert_eq!(index.find_by_sid(&Sid::new("uuid:sid-1")), Some(h1));
        assert_eq!(index.find_by_sid(&Sid::new("uuid:sid-2")), Some(h2));
        assert_eq!(index.handles_for_device(&DeviceId::new("uuid:a")).len(), 2);
        index.assert_consistent();
    }

    #[test]
    fn test_prune_records_outcome() {
        let mut index = SubscriptionIndex::new();
        let svc = service("uuid:a", "s1");
        let handle = subscribed(&mut index, &svc, "uuid:sid-1");

        index.get_mut(handle).unwrap().cancel_local().unwrap();
        assert!(index.prune(handle).is_some());

        assert!(index.find_by_sid(&Sid::new("uuid:sid-1")).is_none());
        assert!(index.handles_for_device(&DeviceId::new("uuid:a")).is_empty());
        assert_eq!(index.status(&svc.key()), SubscriptionStatus::Cancelled);
        assert_eq!(index.len(), 0);
        index.assert_consistent();

        // A fresh subscription replaces the recorded outcome
        subscribing(&mut index, &svc);
        assert_eq!(index.status(&svc.key()), SubscriptionStatus::Subscribing);
    }

    #[test]
    fn test_remove_service_clears_outcome() {
        let mut index = SubscriptionIndex::new();
        let svc = service("uuid:a", "s1");
        let handle = subscribed(&mut index, &svc, "uuid:sid-1");
        index.get_mut(handle).unwrap().cancel_local().unwrap();
        index.prune(handle);

        assert!(index.remove_service(&svc.key()));
        assert_eq!(index.status(&svc.key()), SubscriptionStatus::Unsubscribed);
        assert!(!index.remove_service(&svc.key()));
    }

    #[test]
    fn test_remove_device_only_touches_its_bucket() {
        let mut index = SubscriptionIndex::new();
        let a1 = service("uuid:a", "s1");
        let a2 = service("uuid:a", "s2");
        let b1 = service("uuid:b", "s1");
        subscribed(&mut index, &a1, "uuid:sid-1");
        subscribing(&mut index, &a2);
        subscribed(&mut index, &b1, "uuid:sid-3");

        assert!(index.remove_device(&DeviceId::new("uuid:a")));
        assert_eq!(index.status(&a1.key()), SubscriptionStatus::Unsubscribed);
        assert_eq!(index.status(&a2.key()), SubscriptionStatus::Unsubscribed);
        assert_eq!(index.status(&b1.key()), SubscriptionStatus::Subscribed);
        assert_eq!(index.len(), 1);
        assert_eq!(index.sid_count(), 1);
        index.assert_consistent();

        assert!(!index.remove_device(&DeviceId::new("uuid:a")));
    }

    #[test]
    fn test_clear() {
        let mut index = SubscriptionIndex::new();
        subscribed(&mut index, &service("uuid:a", "s1"), "uuid:sid-1");
        subscribed(&mut index, &service("uuid:b", "s1"), "uuid:sid-2");
        assert_eq!(index.clear(), 2);
        assert_eq!(index.len(), 0);
        assert_eq!(index.sid_count(), 0);
    }
}
