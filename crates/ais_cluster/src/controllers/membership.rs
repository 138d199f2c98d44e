//! Queries the cluster map held by the AIS proxies to confirm that every
//! daemon joined the cluster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::api::v1beta1::aistore::AIStore;
use crate::resources::services::proxy_service_url;
use crate::util::errors::{Error, ErrorReason, Result, StdError};
use crate::util::retry::{poll_until, PollOutcome, RetryPolicy};

const FLAG_MAINTENANCE: u64 = 1 << 2;
const FLAG_DECOMMISSION: u64 = 1 << 3;
const FLAG_MAINTENANCE_POST_REBALANCE: u64 = 1 << 4;
const INACTIVE_FLAGS: u64 = FLAG_MAINTENANCE | FLAG_DECOMMISSION | FLAG_MAINTENANCE_POST_REBALANCE;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    #[serde(rename = "daemon_id", default)]
    pub id: String,
    #[serde(default)]
    pub flags: u64,
}

impl ClusterNode {
    pub fn is_active(&self) -> bool {
        self.flags & INACTIVE_FLAGS == 0
    }
}

/// The subset of the AIS cluster map the operator looks at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterMap {
    #[serde(default)]
    pub pmap: BTreeMap<String, ClusterNode>,
    #[serde(default)]
    pub tmap: BTreeMap<String, ClusterNode>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub proxies: i32,
    pub targets: i32,
}

impl ClusterMap {
    pub fn active_counts(&self) -> ActiveCounts {
        let active = |map: &BTreeMap<String, ClusterNode>| map.values().filter(|n| n.is_active()).count() as i32;
        ActiveCounts {
            proxies: active(&self.pmap),
            targets: active(&self.tmap),
        }
    }
}

#[async_trait]
pub trait MembershipClient: Send + Sync {
    async fn cluster_map(&self, ais: &AIStore) -> Result<ClusterMap>;
}

/// Reads the cluster map from the proxy service.
pub struct HttpMembershipClient {
    client: reqwest::Client,
}

impl HttpMembershipClient {
    pub fn new(insecure_skip_verify: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(|e| external(format!("building membership client failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MembershipClient for HttpMembershipClient {
    async fn cluster_map(&self, ais: &AIStore) -> Result<ClusterMap> {
        let url = format!("{}/v1/daemon?what=smap", proxy_service_url(ais));
        debug!(%url, "fetching cluster map");

        let response = self.client.get(&url).send().await.map_err(|e| {
            error!("Failed to reach proxy service: {}", e);
            external(format!("cluster map request failed: {e}"))
        })?;

        if !response.status().is_success() {
            return Err(external(format!("proxy returned {}", response.status())));
        }

        response
            .json::<ClusterMap>()
            .await
            .map_err(|e| external(format!("malformed cluster map: {e}")))
    }
}

fn external(message: String) -> Error {
    Error::categorize(ErrorReason::ExternalService, StdError::HttpError(message))
}

/// Waits until the active proxies and targets match the effective sizes.
pub async fn wait_for_membership(
    client: &dyn MembershipClient,
    ais: &AIStore,
    policy: &RetryPolicy,
) -> Result<ActiveCounts> {
    let expected = ActiveCounts {
        proxies: ais.proxy_size(),
        targets: ais.target_size(),
    };
    if expected.proxies == 0 && expected.targets == 0 {
        return Ok(expected);
    }

    let outcome = poll_until(policy, "membership", move || async move {
        let counts = client.cluster_map(ais).await?.active_counts();
        Ok((counts == expected).then_some(counts))
    })
    .await;

    match outcome {
        PollOutcome::Converged(counts) => {
            info!(cluster = ais.name_any(), ?counts, "cluster membership converged");
            Ok(counts)
        }
        PollOutcome::TimedOut => Err(Error::categorize(
            ErrorReason::ExternalService,
            StdError::Timeout(format!(
                "cluster map did not reach {} proxies and {} targets",
                expected.proxies, expected.targets
            )),
        )),
        PollOutcome::Failed(e) => Err(e),
    }
}
