//! Fluent construction of a [`Tracer`].
//!
//! Every external collaborator (clock, conntrack backend, cloud check,
//! route and subnet lookups, local addresses) can be injected. Anything not
//! injected falls back to the host implementation.

use std::sync::Arc;

use sockscope_common::config::TracerConfig;
use sockscope_common::error::Result;

use crate::clock::{Clock, MonotonicClock};
use crate::gateway::{
    CloudProvider, DmiCloudProvider, GatewayLookup, ProcRouteLookup, RouteLookup, SubnetProvider,
};
use crate::local::LocalAddrs;
use crate::nat::{self, Conntracker, ConntrackerFactory, NatResolver};
use crate::telemetry::Telemetry;
use crate::tracer::Tracer;

/// Builder for a [`Tracer`].
pub struct TracerBuilder {
    config: TracerConfig,
    clock: Option<Arc<dyn Clock>>,
    conntracker: Option<Box<dyn Conntracker>>,
    factories: Option<Vec<(&'static str, ConntrackerFactory)>>,
    cloud: Option<Box<dyn CloudProvider>>,
    routes: Option<Box<dyn RouteLookup>>,
    subnets: Option<Box<dyn SubnetProvider>>,
    local: Option<LocalAddrs>,
}

impl std::fmt::Debug for TracerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerBuilder")
            .field("config", &self.config)
            .field("conntracker", &self.conntracker)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl TracerBuilder {
    /// Starts from a configuration snapshot.
    #[must_use]
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            clock: None,
            conntracker: None,
            factories: None,
            cloud: None,
            routes: None,
            subnets: None,
            local: None,
        }
    }

    /// Sets the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses an already built conntrack backend, skipping the fallback chain.
    #[must_use]
    pub fn conntracker(mut self, conntracker: Box<dyn Conntracker>) -> Self {
        self.conntracker = Some(conntracker);
        self
    }

    /// Replaces the default conntrack fallback chain.
    #[must_use]
    pub fn conntracker_chain(mut self, chain: Vec<(&'static str, ConntrackerFactory)>) -> Self {
        self.factories = Some(chain);
        self
    }

    /// Sets the cloud environment check.
    #[must_use]
    pub fn cloud(mut self, cloud: Box<dyn CloudProvider>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Sets the route lookup.
    #[must_use]
    pub fn route_lookup(mut self, routes: Box<dyn RouteLookup>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Sets the subnet provider.
    #[must_use]
    pub fn subnet_provider(mut self, subnets: Box<dyn SubnetProvider>) -> Self {
        self.subnets = Some(subnets);
        self
    }

    /// Sets the addresses considered local.
    #[must_use]
    pub fn local_addrs(mut self, local: LocalAddrs) -> Self {
        self.local = Some(local);
        self
    }

    /// Validates the configuration and builds the tracer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or NAT resolution
    /// is enabled and no conntrack backend could be initialized.
    pub fn build(self) -> Result<Tracer> {
        self.config.validate()?;
        let config = self.config;
        let telemetry = Arc::new(Telemetry::default());
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));

        let nat = if config.enable_conntrack {
            let backend = match self.conntracker {
                Some(backend) => backend,
                None => {
                    let chain = self
                        .factories
                        .unwrap_or_else(|| nat::default_factories(&config));
                    nat::create_conntracker(&config, chain)?
                }
            };
            Some(NatResolver::new(
                backend,
                config.nat_retry.clone(),
                Arc::clone(&telemetry),
            ))
        } else {
            None
        };

        let gateway = if config.enable_gateway_lookup {
            let cloud = self
                .cloud
                .unwrap_or_else(|| Box::new(DmiCloudProvider::new(&config.sysfs_root)));
            match self.subnets {
                Some(subnets) => {
                    let routes = self.routes.unwrap_or_else(|| {
                        Box::new(ProcRouteLookup::new(&config.procfs_root, &config.sysfs_root))
                    });
                    GatewayLookup::new(
                        &config,
                        cloud.as_ref(),
                        routes,
                        subnets,
                        Arc::clone(&clock),
                        Arc::clone(&telemetry),
                    )
                }
                None => {
                    tracing::warn!("gateway lookup enabled but no subnet provider configured");
                    None
                }
            }
        } else {
            None
        };

        let local = match self.local {
            Some(local) => local,
            None => LocalAddrs::discover().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "local address discovery failed, only loopback is local");
                LocalAddrs::default()
            }),
        };

        tracing::info!(
            capacity = config.max_tracked_connections,
            conntrack = nat.as_ref().map_or("disabled", NatResolver::kind),
            gateway = gateway.is_some(),
            local_addrs = local.len(),
            "tracer initialized"
        );
        Ok(Tracer::from_parts(config, clock, telemetry, nat, gateway, local))
    }
}
