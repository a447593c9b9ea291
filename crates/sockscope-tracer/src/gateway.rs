//! Gateway and subnet enrichment.
//!
//! Answers "which subnet did this connection leave through" by routing the
//! destination, taking the outgoing interface's hardware address and
//! mapping it to a subnet alias. Every collaborator is injected, so the
//! lookup never touches process-wide state. Errors are cached for a while
//! so unreachable subnets are not queried on every poll.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sockscope_common::config::TracerConfig;
use sockscope_common::error::{Result, SockscopeError};
use sockscope_common::types::ConnectionTuple;

use crate::clock::{Clock, nanos};
use crate::telemetry::Telemetry;

/// A cloud subnet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    /// Provider-side subnet alias.
    pub alias: String,
}

/// Gateway enrichment of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Via {
    /// Subnet the traffic was routed through.
    pub subnet: Subnet,
}

/// Result of routing a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Next hop, `None` for directly connected destinations.
    pub gateway: Option<IpAddr>,
    /// Outgoing interface name.
    pub interface: String,
    /// Hardware address of the outgoing interface.
    pub hw_addr: Option<String>,
}

/// Tells whether the host runs in a cloud whose subnets can be resolved.
pub trait CloudProvider: Send + Sync {
    /// Whether gateway enrichment is meaningful on this host.
    fn is_supported(&self) -> bool;
}

/// Routes a destination the way the kernel would.
pub trait RouteLookup: Send + Sync {
    /// Route taken by traffic from `source` to `dest` in `netns`.
    fn route(&self, source: IpAddr, dest: IpAddr, netns: Option<u32>) -> Option<Route>;
}

/// Maps an interface hardware address to its subnet.
pub trait SubnetProvider: Send + Sync {
    /// Subnet of the interface owning `hw_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error when the subnet cannot be determined.
    fn subnet_for_hw_addr(&self, hw_addr: &str) -> Result<Subnet>;
}

/// Fixed answer, for hosts where the environment is known up front.
#[derive(Debug, Clone, Copy)]
pub struct StaticCloud(pub bool);

impl CloudProvider for StaticCloud {
    fn is_supported(&self) -> bool {
        self.0
    }
}

/// Detects AWS EC2 instances from DMI identifiers in sysfs.
#[derive(Debug, Clone)]
pub struct DmiCloudProvider {
    sysfs_root: PathBuf,
}

impl DmiCloudProvider {
    /// Reads identifiers below `sysfs_root`.
    #[must_use]
    pub fn new(sysfs_root: &Path) -> Self {
        Self {
            sysfs_root: sysfs_root.to_path_buf(),
        }
    }
}

impl CloudProvider for DmiCloudProvider {
    fn is_supported(&self) -> bool {
        let dmi = self.sysfs_root.join("class/dmi/id");
        ["sys_vendor", "product_name", "bios_vendor"].iter().any(|f| {
            std::fs::read_to_string(dmi.join(f))
                .is_ok_and(|v| v.contains("Amazon EC2") || v.trim() == "Amazon")
        })
    }
}

/// Subnets from a fixed hardware address table.
#[derive(Debug, Clone, Default)]
pub struct StaticSubnets {
    by_hw_addr: HashMap<String, Subnet>,
}

impl StaticSubnets {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `hw_addr` to the subnet `alias`.
    #[must_use]
    pub fn with(mut self, hw_addr: impl Into<String>, alias: impl Into<String>) -> Self {
        let _ = self.by_hw_addr.insert(
            hw_addr.into().to_ascii_lowercase(),
            Subnet {
                alias: alias.into(),
            },
        );
        self
    }
}

impl SubnetProvider for StaticSubnets {
    fn subnet_for_hw_addr(&self, hw_addr: &str) -> Result<Subnet> {
        self.by_hw_addr
            .get(&hw_addr.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| SockscopeError::Lookup {
                message: format!("no subnet known for interface {hw_addr}"),
            })
    }
}

/// IPv4 route lookups from `/proc/net/route` and `/sys/class/net`.
///
/// Only the root namespace's main table is visible there, so the namespace
/// argument is ignored.
#[derive(Debug, Clone)]
pub struct ProcRouteLookup {
    procfs_root: PathBuf,
    sysfs_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteLine {
    interface: String,
    destination: Ipv4Addr,
    gateway: Ipv4Addr,
    mask: Ipv4Addr,
}

impl ProcRouteLookup {
    /// Reads routes below `procfs_root` and interfaces below `sysfs_root`.
    #[must_use]
    pub fn new(procfs_root: &Path, sysfs_root: &Path) -> Self {
        Self {
            procfs_root: procfs_root.to_path_buf(),
            sysfs_root: sysfs_root.to_path_buf(),
        }
    }

    fn routes(&self) -> Vec<RouteLine> {
        let path = self.procfs_root.join("net/route");
        match std::fs::read_to_string(&path) {
            Ok(content) => content.lines().skip(1).filter_map(parse_route_line).collect(),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "cannot read route table");
                Vec::new()
            }
        }
    }

    fn hw_addr(&self, interface: &str) -> Option<String> {
        let path = self.sysfs_root.join("class/net").join(interface).join("address");
        let addr = std::fs::read_to_string(path).ok()?;
        let addr = addr.trim();
        (!addr.is_empty()).then(|| addr.to_ascii_lowercase())
    }
}

/// Decodes an address as `/proc/net/route` prints it: the raw network-order
/// word as a host-order hex integer.
fn route_addr(hex: &str) -> Option<Ipv4Addr> {
    u32::from_str_radix(hex, 16)
        .ok()
        .map(|v| Ipv4Addr::from(v.to_ne_bytes()))
}

fn parse_route_line(line: &str) -> Option<RouteLine> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 8 {
        return None;
    }
    Some(RouteLine {
        interface: cols[0].to_string(),
        destination: route_addr(cols[1])?,
        gateway: route_addr(cols[2])?,
        mask: route_addr(cols[7])?,
    })
}

impl RouteLookup for ProcRouteLookup {
    fn route(&self, _source: IpAddr, dest: IpAddr, _netns: Option<u32>) -> Option<Route> {
        let IpAddr::V4(dest) = dest else {
            return None;
        };
        let dest_bits = u32::from(dest);
        let best = self
            .routes()
            .into_iter()
            .filter(|r| dest_bits & u32::from(r.mask) == u32::from(r.destination))
            .max_by_key(|r| u32::from(r.mask).count_ones())?;
        let gateway = (!best.gateway.is_unspecified()).then_some(IpAddr::V4(best.gateway));
        let hw_addr = self.hw_addr(&best.interface);
        Some(Route {
            gateway,
            interface: best.interface,
            hw_addr,
        })
    }
}

/// FIFO-bounded map whose values carry an expiry.
#[derive(Debug)]
struct TtlCache<K, V> {
    entries: HashMap<K, (V, u64)>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V: Clone> TtlCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, key: &K, now: u64) -> Option<V> {
        let (value, expires) = self.entries.get(key)?;
        if *expires > now {
            return Some(value.clone());
        }
        let _ = self.entries.remove(key);
        self.order.retain(|k| k != key);
        None
    }

    fn insert(&mut self, key: K, value: V, expires: u64) {
        if self.entries.insert(key.clone(), (value, expires)).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            let _ = self.entries.remove(&oldest);
        }
    }
}

type RouteKey = (IpAddr, IpAddr, Option<u32>);

/// Cached gateway lookups.
pub struct GatewayLookup {
    routes: Box<dyn RouteLookup>,
    subnets: Box<dyn SubnetProvider>,
    route_cache: Mutex<TtlCache<RouteKey, Option<Route>>>,
    subnet_cache: Mutex<TtlCache<String, Option<Subnet>>>,
    route_ttl_ns: u64,
    error_ttl_ns: u64,
    clock: Arc<dyn Clock>,
    telemetry: Arc<Telemetry>,
}

impl std::fmt::Debug for GatewayLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayLookup")
            .field("route_ttl_ns", &self.route_ttl_ns)
            .field("error_ttl_ns", &self.error_ttl_ns)
            .finish_non_exhaustive()
    }
}

impl GatewayLookup {
    /// Builds the lookup if it is enabled and the cloud is supported.
    ///
    /// The cloud check runs once, here.
    #[must_use]
    pub fn new(
        config: &TracerConfig,
        cloud: &dyn CloudProvider,
        routes: Box<dyn RouteLookup>,
        subnets: Box<dyn SubnetProvider>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<Telemetry>,
    ) -> Option<Self> {
        if !config.enable_gateway_lookup {
            return None;
        }
        if !cloud.is_supported() {
            tracing::info!("gateway lookup disabled: cloud environment not supported");
            return None;
        }
        Some(Self {
            routes,
            subnets,
            route_cache: Mutex::new(TtlCache::new(config.gateway_cache_size)),
            subnet_cache: Mutex::new(TtlCache::new(config.gateway_cache_size)),
            route_ttl_ns: nanos(Duration::from_secs(config.gateway_route_cache_ttl_secs)),
            error_ttl_ns: nanos(Duration::from_secs(config.gateway_error_ttl_secs)),
            clock,
            telemetry,
        })
    }

    /// Subnet the connection was routed through.
    ///
    /// Loopback traffic and routes without a gateway have none.
    pub fn lookup(&self, tuple: &ConnectionTuple) -> Option<Via> {
        if tuple.dest.is_loopback() || tuple.source.is_loopback() {
            return None;
        }
        let route = self.route(tuple)?;
        route.gateway?;
        let hw_addr = route.hw_addr?;
        self.subnet(&hw_addr).map(|subnet| Via { subnet })
    }

    fn route(&self, tuple: &ConnectionTuple) -> Option<Route> {
        let key = (tuple.source, tuple.dest, tuple.netns);
        let now = self.clock.now_ns();
        if let Some(cached) = self.route_cache.lock().get(&key, now) {
            return cached;
        }
        let route = self.routes.route(tuple.source, tuple.dest, tuple.netns);
        self.route_cache
            .lock()
            .insert(key, route.clone(), now.saturating_add(self.route_ttl_ns));
        route
    }

    fn subnet(&self, hw_addr: &str) -> Option<Subnet> {
        let now = self.clock.now_ns();
        if let Some(cached) = self.subnet_cache.lock().get(&hw_addr.to_string(), now) {
            return cached;
        }
        match self.subnets.subnet_for_hw_addr(hw_addr) {
            Ok(subnet) => {
                self.subnet_cache
                    .lock()
                    .insert(hw_addr.to_string(), Some(subnet.clone()), u64::MAX);
                Some(subnet)
            }
            Err(e) => {
                Telemetry::incr(&self.telemetry.gateway_errors);
                tracing::debug!(hw_addr, error = %e, "subnet lookup failed");
                self.subnet_cache.lock().insert(
                    hw_addr.to_string(),
                    None,
                    now.saturating_add(self.error_ttl_ns),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sockscope_common::types::ConnType;

    use super::*;
    use crate::clock::ManualClock;

    const HW: &str = "0a:1b:2c:3d:4e:5f";

    struct FixedRoute(Option<Route>);

    impl RouteLookup for FixedRoute {
        fn route(&self, _: IpAddr, _: IpAddr, _: Option<u32>) -> Option<Route> {
            self.0.clone()
        }
    }

    struct CountingSubnets {
        calls: Arc<AtomicUsize>,
        answer: Option<&'static str>,
    }

    impl SubnetProvider for CountingSubnets {
        fn subnet_for_hw_addr(&self, _: &str) -> Result<Subnet> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
                .map(|alias| Subnet {
                    alias: alias.into(),
                })
                .ok_or_else(|| SockscopeError::Lookup {
                    message: "metadata unavailable".into(),
                })
        }
    }

    fn via_gateway() -> Option<Route> {
        Some(Route {
            gateway: Some("10.0.0.1".parse().expect("ip")),
            interface: "eth0".into(),
            hw_addr: Some(HW.into()),
        })
    }

    fn enabled() -> TracerConfig {
        TracerConfig {
            enable_gateway_lookup: true,
            gateway_error_ttl_secs: 10,
            ..TracerConfig::default()
        }
    }

    fn tuple(dest: &str) -> ConnectionTuple {
        ConnectionTuple::new(
            ConnType::Tcp,
            "10.0.0.5".parse().expect("ip"),
            40000,
            dest.parse().expect("ip"),
            443,
        )
    }

    fn lookup(
        route: Option<Route>,
        answer: Option<&'static str>,
        clock: Arc<ManualClock>,
    ) -> (GatewayLookup, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let gw = GatewayLookup::new(
            &enabled(),
            &StaticCloud(true),
            Box::new(FixedRoute(route)),
            Box::new(CountingSubnets {
                calls: Arc::clone(&calls),
                answer,
            }),
            clock,
            Arc::new(Telemetry::default()),
        )
        .expect("enabled");
        (gw, calls)
    }

    #[test]
    fn unsupported_cloud_disables_lookup() {
        let gw = GatewayLookup::new(
            &enabled(),
            &StaticCloud(false),
            Box::new(FixedRoute(via_gateway())),
            Box::new(StaticSubnets::new()),
            Arc::new(ManualClock::new(0)),
            Arc::new(Telemetry::default()),
        );
        assert!(gw.is_none());
    }

    #[test]
    fn resolves_subnet_through_gateway() {
        let (gw, calls) = lookup(via_gateway(), Some("subnet-a"), Arc::new(ManualClock::new(0)));
        let via = gw.lookup(&tuple("93.184.216.34")).expect("via");
        assert_eq!(via.subnet.alias, "subnet-a");
        let _ = gw.lookup(&tuple("1.1.1.1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loopback_and_direct_routes_have_no_via() {
        let (gw, calls) = lookup(via_gateway(), Some("subnet-a"), Arc::new(ManualClock::new(0)));
        assert!(gw.lookup(&tuple("127.0.0.1")).is_none());

        let direct = Route {
            gateway: None,
            ..via_gateway().expect("route")
        };
        let (gw_direct, _) = lookup(Some(direct), Some("subnet-a"), Arc::new(ManualClock::new(0)));
        assert!(gw_direct.lookup(&tuple("10.0.0.9")).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn errors_are_cached_until_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let (gw, calls) = lookup(via_gateway(), None, Arc::clone(&clock));
        assert!(gw.lookup(&tuple("93.184.216.34")).is_none());
        assert!(gw.lookup(&tuple("8.8.8.8")).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(11));
        assert!(gw.lookup(&tuple("8.8.8.8")).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_interface_is_a_lookup_failure() {
        let subnets = StaticSubnets::new().with("0A:00:00:00:00:01", "subnet-0abc");
        assert_eq!(
            subnets.subnet_for_hw_addr("0a:00:00:00:00:01").expect("known").alias,
            "subnet-0abc"
        );
        let err = subnets.subnet_for_hw_addr("0a:00:00:00:00:02").unwrap_err();
        assert!(matches!(err, SockscopeError::Lookup { .. }));
        assert!(err.to_string().contains("0a:00:00:00:00:02"));
    }

    #[test]
    fn ttl_cache_is_bounded() {
        let mut cache = TtlCache::new(2);
        cache.insert(1, "a", 100);
        cache.insert(2, "b", 100);
        cache.insert(3, "c", 100);
        assert_eq!(cache.get(&1, 0), None);
        assert_eq!(cache.get(&3, 0), Some("c"));
        assert_eq!(cache.get(&3, 100), None);
    }

    fn hex(addr: [u8; 4]) -> String {
        format!("{:08X}", u32::from_ne_bytes(addr))
    }

    #[test]
    fn proc_routes_use_longest_prefix_match() {
        let dir = tempfile::tempdir().expect("tempdir");
        let net = dir.path().join("proc/net");
        std::fs::create_dir_all(&net).expect("mkdir");
        let table = format!(
            "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
             eth0\t{}\t{}\t0003\t0\t0\t100\t{}\t0\t0\t0\n\
             eth1\t{}\t{}\t0001\t0\t0\t0\t{}\t0\t0\t0\n",
            hex([0, 0, 0, 0]),
            hex([10, 0, 0, 1]),
            hex([0, 0, 0, 0]),
            hex([192, 168, 5, 0]),
            hex([0, 0, 0, 0]),
            hex([255, 255, 255, 0]),
        );
        std::fs::write(net.join("route"), table).expect("route");
        let iface = dir.path().join("sys/class/net/eth0");
        std::fs::create_dir_all(&iface).expect("mkdir");
        std::fs::write(iface.join("address"), "0A:1B:2C:3D:4E:5F\n").expect("address");

        let routes = ProcRouteLookup::new(&dir.path().join("proc"), &dir.path().join("sys"));
        let src: IpAddr = "10.0.0.5".parse().expect("ip");

        let default = routes
            .route(src, "93.184.216.34".parse().expect("ip"), None)
            .expect("default route");
        assert_eq!(default.interface, "eth0");
        assert_eq!(default.gateway, Some("10.0.0.1".parse().expect("ip")));
        assert_eq!(default.hw_addr.as_deref(), Some(HW));

        let local = routes
            .route(src, "192.168.5.20".parse().expect("ip"), None)
            .expect("local route");
        assert_eq!(local.interface, "eth1");
        assert_eq!(local.gateway, None);
        assert_eq!(local.hw_addr, None);
    }

    #[test]
    fn dmi_vendor_marks_cloud_supported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dmi = dir.path().join("class/dmi/id");
        std::fs::create_dir_all(&dmi).expect("mkdir");
        assert!(!DmiCloudProvider::new(dir.path()).is_supported());
        std::fs::write(dmi.join("sys_vendor"), "Amazon EC2\n").expect("write");
        assert!(DmiCloudProvider::new(dir.path()).is_supported());
    }
}
