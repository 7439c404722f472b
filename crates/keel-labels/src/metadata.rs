//! Machine-metadata lookups
//!
//! Instance-type attributes (CPU, memory, GPU count, category) come from a
//! cloudinfo-style HTTP service. The lookup is a trait so the reconciler can be
//! tested without the network.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::debug;

use keel_common::config::MetadataSettings;
use keel_common::model::{CloudKind, Distribution};
use keel_common::Error;

/// Attributes of one instance type, keyed by short attribute name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineDetails {
    /// Attribute name (`cpu`, `memory`, ...) to label-safe value
    pub attributes: BTreeMap<String, String>,
}

/// Looks up instance-type attributes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineMetadata: Send + Sync {
    /// Attributes for `instance_type` in the given cloud/distribution/region
    async fn machine_details(
        &self,
        cloud: CloudKind,
        distribution: Distribution,
        region: &str,
        instance_type: &str,
    ) -> Result<MachineDetails, Error>;
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    products: Vec<Product>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Product {
    #[serde(rename = "type")]
    instance_type: String,
    #[serde(default)]
    cpus_per_vm: f64,
    #[serde(default)]
    mem_per_vm: f64,
    #[serde(default)]
    gpus_per_vm: f64,
    #[serde(default)]
    category: String,
    #[serde(default)]
    ntw_perf_category: String,
}

impl Product {
    fn details(&self) -> MachineDetails {
        let mut attributes = BTreeMap::new();
        attributes.insert("cpu".to_string(), format_number(self.cpus_per_vm));
        attributes.insert("memory".to_string(), format_number(self.mem_per_vm));
        attributes.insert("gpu".to_string(), format_number(self.gpus_per_vm));
        if !self.category.is_empty() {
            attributes.insert("category".to_string(), label_value(&self.category));
        }
        if !self.ntw_perf_category.is_empty() {
            attributes.insert(
                "network-perf".to_string(),
                label_value(&self.ntw_perf_category),
            );
        }
        MachineDetails { attributes }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Coerce free text into a valid Kubernetes label value
fn label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// The cloudinfo service name for a distribution
fn service_name(distribution: Distribution) -> &'static str {
    match distribution {
        Distribution::Ec2 | Distribution::Pke => "compute",
        other => other.as_str(),
    }
}

/// HTTP client for a cloudinfo-compatible metadata service
pub struct CloudInfoClient {
    endpoint: String,
    http: reqwest::Client,
}

impl CloudInfoClient {
    /// Build from settings; `None` when no endpoint is configured
    pub fn from_settings(settings: &MetadataSettings) -> Result<Option<Self>, Error> {
        settings
            .endpoint
            .as_deref()
            .map(|endpoint| {
                Self::new(
                    endpoint,
                    Duration::from_secs(settings.request_timeout_secs),
                )
            })
            .transpose()
    }

    /// Create a client for `endpoint` with a per-request timeout
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::internal_with_context("metadata", format!("failed to create HTTP client: {e}"))
            })?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn products_url(&self, cloud: CloudKind, distribution: Distribution, region: &str) -> String {
        format!(
            "{}/api/v1/providers/{}/services/{}/regions/{}/products",
            self.endpoint,
            cloud.as_str(),
            service_name(distribution),
            region
        )
    }
}

#[async_trait]
impl MachineMetadata for CloudInfoClient {
    async fn machine_details(
        &self,
        cloud: CloudKind,
        distribution: Distribution,
        region: &str,
        instance_type: &str,
    ) -> Result<MachineDetails, Error> {
        let url = self.products_url(cloud, distribution, region);
        debug!(%url, instance_type, "querying machine metadata");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                Error::internal_with_context("metadata", format!("request to {url} failed: {e}"))
            })?;

        let body: ProductsResponse = response
            .json()
            .await
            .map_err(|e| Error::serialization_for_kind("products", e.to_string()))?;

        body.products
            .iter()
            .find(|p| p.instance_type == instance_type)
            .map(Product::details)
            .ok_or_else(|| Error::not_found("instance type", instance_type))
    }
}
