//! Mapping from provider variant to driver constructor
//!
//! Adding a provider is one `register` call. The orchestrator resolves the
//! variant from the record and never names a concrete driver type.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use keel_common::{Error, Result};

use super::alibaba::AlibabaFlavor;
use super::ec2::Ec2Flavor;
use super::eks::EksFlavor;
use super::gke::GkeFlavor;
use super::managed::{ManagedDriver, ManagedFlavor};
use super::pke::PkeDriver;
use super::{DriverContext, DriverKind, ManagedClusterApi, ProviderDriver};

/// Builds a driver bound to the cluster in a [`DriverContext`]
pub type DriverConstructor =
    Arc<dyn Fn(DriverContext) -> Result<Box<dyn ProviderDriver>> + Send + Sync>;

/// Wire clients for the built-in variants, keyed by the variant they serve
#[derive(Clone, Default)]
pub struct CloudApis {
    apis: BTreeMap<DriverKind, Arc<dyn ManagedClusterApi>>,
}

impl CloudApis {
    /// No clients
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `kind` through `api`
    pub fn with(mut self, kind: DriverKind, api: Arc<dyn ManagedClusterApi>) -> Self {
        self.apis.insert(kind, api);
        self
    }

    /// Client for `kind`, if one was provided
    pub fn get(&self, kind: DriverKind) -> Option<Arc<dyn ManagedClusterApi>> {
        self.apis.get(&kind).cloned()
    }
}

/// Variant to constructor table
#[derive(Clone, Default)]
pub struct DriverRegistry {
    constructors: BTreeMap<DriverKind, DriverConstructor>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in variant for every client in `apis`
    pub fn with_defaults(apis: CloudApis) -> Self {
        let mut registry = Self::new();
        for kind in DriverKind::ALL {
            let Some(api) = apis.get(kind) else {
                continue;
            };
            let constructor: DriverConstructor = match kind {
                DriverKind::Ec2Pke => Arc::new(move |ctx: DriverContext| {
                    Ok(Box::new(PkeDriver::new(ctx, api.clone())) as Box<dyn ProviderDriver>)
                }),
                managed => {
                    let flavor = managed_flavor(managed);
                    Arc::new(move |ctx: DriverContext| {
                        let settings = match managed {
                            DriverKind::Alibaba => ctx.settings.alibaba.clone(),
                            DriverKind::Ec2 => ctx.settings.ec2.clone(),
                            DriverKind::Gke => ctx.settings.gke.clone(),
                            DriverKind::Eks => ctx.settings.eks.clone(),
                            DriverKind::Ec2Pke => ctx.settings.pke.clone(),
                        };
                        Ok(Box::new(ManagedDriver::new(
                            flavor.clone(),
                            api.clone(),
                            settings,
                            ctx.record,
                            ctx.node_pools,
                        )) as Box<dyn ProviderDriver>)
                    })
                }
            };
            registry.register(kind, constructor);
        }
        registry
    }

    /// Register (or replace) the constructor for `kind`
    pub fn register(&mut self, kind: DriverKind, constructor: DriverConstructor) {
        debug!(provider = %kind, "registering driver");
        self.constructors.insert(kind, constructor);
    }

    /// Whether `kind` has a constructor
    pub fn supports(&self, kind: DriverKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Build the driver for the cluster in `ctx`
    pub fn build(&self, ctx: DriverContext) -> Result<Box<dyn ProviderDriver>> {
        let kind = DriverKind::for_record(&ctx.record)?;
        let constructor = self.constructors.get(&kind).ok_or_else(|| {
            Error::validation_for(
                &ctx.record.name,
                format!("no driver registered for provider {kind}"),
            )
        })?;
        constructor(ctx)
    }
}

fn managed_flavor(kind: DriverKind) -> Arc<dyn ManagedFlavor> {
    match kind {
        DriverKind::Alibaba => Arc::new(AlibabaFlavor),
        DriverKind::Ec2 | DriverKind::Ec2Pke => Arc::new(Ec2Flavor),
        DriverKind::Gke => Arc::new(GkeFlavor),
        DriverKind::Eks => Arc::new(EksFlavor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::managed::tests::demo_request;
    use crate::driver::{CreationMode, MockManagedClusterApi, MockProviderDriver};
    use crate::store::{MemoryClusterStore, MemorySecretStore};
    use keel_common::config::DriverSettings;
    use keel_common::model::{CloudKind, Distribution};

    fn context(cloud: CloudKind, distribution: Distribution) -> DriverContext {
        let (mut record, node_pools) = demo_request().to_records();
        record.cloud = cloud;
        record.distribution = distribution;
        DriverContext {
            record,
            node_pools,
            settings: Arc::new(DriverSettings::default()),
            store: Arc::new(MemoryClusterStore::new()),
            secrets: Arc::new(MemorySecretStore::new()),
        }
    }

    fn all_apis() -> CloudApis {
        DriverKind::ALL.into_iter().fold(CloudApis::new(), |apis, kind| {
            apis.with(kind, Arc::new(MockManagedClusterApi::new()))
        })
    }

    #[test]
    fn test_defaults_build_every_variant() {
        let registry = DriverRegistry::with_defaults(all_apis());
        let cases = [
            (CloudKind::Alibaba, Distribution::Acsk, DriverKind::Alibaba),
            (CloudKind::Amazon, Distribution::Ec2, DriverKind::Ec2),
            (CloudKind::Amazon, Distribution::Pke, DriverKind::Ec2Pke),
            (CloudKind::Google, Distribution::Gke, DriverKind::Gke),
            (CloudKind::Amazon, Distribution::Eks, DriverKind::Eks),
        ];
        for (cloud, distribution, kind) in cases {
            let driver = registry.build(context(cloud, distribution)).unwrap();
            assert_eq!(driver.kind(), kind);
        }

        let pke = registry
            .build(context(CloudKind::Amazon, Distribution::Pke))
            .unwrap();
        assert_eq!(pke.creation_mode(), CreationMode::SelfRegistering);
    }

    #[test]
    fn test_missing_client_leaves_variant_unregistered() {
        let apis = CloudApis::new().with(DriverKind::Gke, Arc::new(MockManagedClusterApi::new()));
        let registry = DriverRegistry::with_defaults(apis);

        assert!(registry.supports(DriverKind::Gke));
        assert!(!registry.supports(DriverKind::Eks));
        let err = registry
            .build(context(CloudKind::Amazon, Distribution::Eks))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_register_replaces_constructor() {
        let mut registry = DriverRegistry::with_defaults(all_apis());
        registry.register(
            DriverKind::Eks,
            Arc::new(|_: DriverContext| {
                let mut driver = MockProviderDriver::new();
                driver.expect_kind().return_const(DriverKind::Eks);
                driver
                    .expect_creation_mode()
                    .return_const(CreationMode::SelfRegistering);
                Ok(Box::new(driver) as Box<dyn ProviderDriver>)
            }),
        );

        let driver = registry
            .build(context(CloudKind::Amazon, Distribution::Eks))
            .unwrap();
        assert_eq!(driver.creation_mode(), CreationMode::SelfRegistering);
    }

    #[test]
    fn test_unsupported_pair_rejected() {
        let registry = DriverRegistry::with_defaults(all_apis());
        assert!(registry
            .build(context(CloudKind::Google, Distribution::Acsk))
            .is_err());
    }
}
