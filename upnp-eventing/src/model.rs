//! Device/service object model consumed by the subscription manager.
//!
//! Description parsing lives elsewhere; the manager only needs to walk a tree
//! of devices, find the evented services, and hand state-variable changes
//! back to the service that owns a subscription.

use std::collections::HashSet;
use std::sync::Arc;

use url::Url;

use crate::notify::StateVariableChange;
use crate::types::{DeviceId, ServiceKey, VisitMode};

/// A remote UPnP service as seen by the eventing layer.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: change sets are delivered from the
/// task that handles the NOTIFY request.
pub trait ServiceProxy: Send + Sync {
    /// Identity of the service within its device tree. `device_id` is the
    /// UDN of the device that owns the service, and is what subscriptions
    /// are bucketed by.
    fn key(&self) -> ServiceKey;

    /// Whether the service publishes evented state variables.
    fn is_evented(&self) -> bool;

    /// Absolute event subscription URL (`eventSubURL` resolved against the
    /// device location).
    fn event_sub_url(&self) -> Url;

    /// Locations the owning device was discovered at. Used to choose a
    /// callback root reachable from the device.
    fn device_locations(&self) -> Vec<Url>;

    /// Receive the state-variable changes carried by one NOTIFY request.
    fn on_state_changes(&self, changes: &[StateVariableChange]);
}

/// A UPnP device with its services and embedded devices.
pub trait DeviceProxy: Send + Sync {
    fn device_id(&self) -> DeviceId;

    fn services(&self) -> Vec<Arc<dyn ServiceProxy>>;

    fn child_devices(&self) -> Vec<Arc<dyn DeviceProxy>>;
}

/// Walks a device tree depth-first, pre-order, services before children.
///
/// Each device is visited at most once, even if it appears several times in
/// the tree.
struct TreeWalk {
    mode: VisitMode,
    visited: HashSet<DeviceId>,
}

impl TreeWalk {
    fn new(mode: VisitMode) -> Self {
        Self {
            mode,
            visited: HashSet::new(),
        }
    }

    fn walk<F>(&mut self, device: &dyn DeviceProxy, visit: &mut F)
    where
        F: FnMut(&dyn DeviceProxy),
    {
        if !self.visited.insert(device.device_id()) {
            return;
        }

        visit(device);

        if self.mode == VisitMode::Recursive {
            for child in device.child_devices() {
                self.walk(child.as_ref(), visit);
            }
        }
    }
}

/// Every service reachable from `device` under `mode`, in visit order.
pub fn collect_services(device: &dyn DeviceProxy, mode: VisitMode) -> Vec<Arc<dyn ServiceProxy>> {
    let mut services = Vec::new();
    TreeWalk::new(mode).walk(device, &mut |d: &dyn DeviceProxy| services.extend(d.services()));
    services
}

/// IDs of every device reachable from `device` under `mode`, in visit order.
pub fn collect_device_ids(device: &dyn DeviceProxy, mode: VisitMode) -> Vec<DeviceId> {
    let mut ids = Vec::new();
    TreeWalk::new(mode).walk(device, &mut |d: &dyn DeviceProxy| ids.push(d.device_id()));
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Service {
        key: ServiceKey,
        evented: bool,
    }

    impl ServiceProxy for Service {
        fn key(&self) -> ServiceKey {
            self.key.clone()
        }

        fn is_evented(&self) -> bool {
            self.evented
        }

        fn event_sub_url(&self) -> Url {
            Url::parse("http://192.168.1.10:1400/event").unwrap()
        }

        fn device_locations(&self) -> Vec<Url> {
            Vec::new()
        }

        fn on_state_changes(&self, _changes: &[StateVariableChange]) {}
    }

    struct Device {
        id: DeviceId,
        services: Vec<Arc<dyn ServiceProxy>>,
        children: Vec<Arc<dyn DeviceProxy>>,
    }

    impl DeviceProxy for Device {
        fn device_id(&self) -> DeviceId {
            self.id.clone()
        }

        fn services(&self) -> Vec<Arc<dyn ServiceProxy>> {
            self.services.clone()
        }

        fn child_devices(&self) -> Vec<Arc<dyn DeviceProxy>> {
            self.children.clone()
        }
    }

    fn device(
        id: &str,
        services: &[&str],
        children: Vec<Arc<dyn DeviceProxy>>,
    ) -> Arc<dyn DeviceProxy> {
        Arc::new(Device {
            id: DeviceId::new(id),
            services: services
                .iter()
                .map(|s| {
                    Arc::new(Service {
                        key: ServiceKey::new(id, *s),
                        evented: true,
                    }) as Arc<dyn ServiceProxy>
                })
                .collect(),
            children,
        })
    }

    fn names(services: &[Arc<dyn ServiceProxy>]) -> Vec<String> {
        services.iter().map(|s| s.key().to_string()).collect()
    }

    #[test]
    fn test_this_only_skips_children() {
        let child = device("child", &["c1"], vec![]);
        let root = device("root", &["r1", "r2"], vec![child]);

        let services = collect_services(root.as_ref(), VisitMode::ThisOnly);
        assert_eq!(names(&services), vec!["root/r1", "root/r2"]);
    }

    #[test]
    fn test_recursive_is_preorder_services_first() {
        let grandchild = device("grandchild", &["g1"], vec![]);
        let child_a = device("a", &["a1"], vec![grandchild]);
        let child_b = device("b", &["b1"], vec![]);
        let root = device("root", &["r1"], vec![child_a, child_b]);

        let services = collect_services(root.as_ref(), VisitMode::Recursive);
        assert_eq!(
            names(&services),
            vec!["root/r1", "a/a1", "grandchild/g1", "b/b1"]
        );

        let ids = collect_device_ids(root.as_ref(), VisitMode::Recursive);
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_shared_device_visited_once() {
        let shared = device("shared", &["s1"], vec![]);
        let a = device("a", &[], vec![shared.clone()]);
        let b = device("b", &[], vec![shared]);
        let root = device("root", &[], vec![a, b]);

        let services = collect_services(root.as_ref(), VisitMode::Recursive);
        assert_eq!(names(&services), vec!["shared/s1"]);
    }
}
