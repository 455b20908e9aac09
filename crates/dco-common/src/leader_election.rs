//! Single-active-replica coordination through a `coordination.k8s.io/v1` Lease
//!
//! Every Lease write is a `replace` carrying the resourceVersion that was read,
//! so a concurrent writer makes the API server answer 409 and the attempt is
//! treated as a lost race. Two replicas can therefore never both lead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result, OPERATOR_NAME};

/// Lease shared by every operator replica
pub const LEADER_LEASE_NAME: &str = "distributed-compute-operator-leader";

/// Lease timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a holder stays leader without renewing
    pub duration: Duration,
    /// Holder renewal period; must be well below `duration`
    pub renew: Duration,
    /// Pause between attempts of a standby replica
    pub retry: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            renew: Duration::from_secs(10),
            retry: Duration::from_secs(5),
        }
    }
}

/// What a replica may do with the Lease it just read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// We hold it; bump the renew time
    Renew,
    /// Nobody holds it in time; take it over as transition `n`
    TakeOver(i32),
    /// Somebody else holds it
    Held,
}

fn claim(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> Claim {
    let Some(spec) = spec else {
        return Claim::TakeOver(1);
    };
    if spec.holder_identity.as_deref() == Some(identity) {
        return Claim::Renew;
    }
    let transitions = spec.lease_transitions.unwrap_or(0);
    let live = match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => now <= renewed.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => false,
    };
    match (live, spec.holder_identity.as_deref()) {
        (true, Some(_)) => Claim::Held,
        _ => Claim::TakeOver(transitions + 1),
    }
}

/// Competes for the Lease on behalf of one replica
pub struct LeaderElector {
    leases: Api<Lease>,
    lease_name: String,
    identity: String,
    timing: LeaseTiming,
}

impl LeaderElector {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self::with_timing(client, lease_name, namespace, identity, LeaseTiming::default())
    }

    pub fn with_timing(
        client: Client,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        timing: LeaseTiming,
    ) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            timing,
        }
    }

    /// Wait until this replica leads. The returned guard renews the Lease in
    /// the background until it is dropped.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership");
        loop {
            match self.attempt().await {
                Ok(true) => break,
                Ok(false) => debug!("Lease held by another replica"),
                Err(e) => warn!(error = %e, "Lease attempt failed"),
            }
            tokio::time::sleep(self.timing.retry).await;
        }
        info!(identity = %self.identity, "Leadership acquired");

        let (leading_tx, leading_rx) = watch::channel(true);
        let elector = Arc::clone(&self);
        let renewal = tokio::spawn(async move { elector.keep_renewing(leading_tx).await });
        LeaderGuard {
            elector: self,
            renewal,
            leading: leading_rx,
        }
    }

    async fn keep_renewing(&self, leading: watch::Sender<bool>) {
        let mut ticker = tokio::time::interval(self.timing.renew);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.attempt().await {
                Ok(true) => debug!("Lease renewed"),
                outcome => {
                    if let Err(e) = outcome {
                        warn!(error = %e, "Lease renewal failed");
                    }
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = leading.send(false);
                    return;
                }
            }
        }
    }

    /// One read-decide-write round; true when this replica holds the Lease
    /// afterwards
    async fn attempt(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(current) = self.leases.get_opt(&self.lease_name).await? else {
            let fresh = Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    ..Default::default()
                },
                spec: Some(self.holder_spec(now, 0)),
            };
            return match self.leases.create(&PostParams::default(), &fresh).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let mut next = current.clone();
        match claim(current.spec.as_ref(), &self.identity, now) {
            Claim::Held => return Ok(false),
            Claim::Renew => {
                let spec = next.spec.get_or_insert_with(|| self.holder_spec(now, 0));
                spec.renew_time = Some(MicroTime(now));
            }
            Claim::TakeOver(transitions) => {
                info!(identity = %self.identity, transitions, "Taking over expired lease");
                next.spec = Some(self.holder_spec(now, transitions));
            }
        }
        self.replace(&next).await
    }

    async fn replace(&self, lease: &Lease) -> Result<bool> {
        if lease.metadata.resource_version.is_none() {
            return Err(Error::internal_with_context(
                "leader-election",
                "lease is missing its resourceVersion",
            ));
        }
        match self
            .leases
            .replace(&self.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn holder_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.timing.duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Hand the Lease back by clearing the holder and backdating the renewal
    async fn release(&self) -> Result<()> {
        let Some(lease) = self.leases.get_opt(&self.lease_name).await? else {
            return Ok(());
        };
        if claim(lease.spec.as_ref(), &self.identity, Utc::now()) != Claim::Renew {
            return Ok(());
        }

        let expired = Utc::now() - chrono::Duration::seconds(2 * self.timing.duration.as_secs() as i64);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": expired.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            }
        });
        self.leases
            .patch(&self.lease_name, &PatchParams::apply(OPERATOR_NAME), &Patch::Merge(&patch))
            .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Held while this replica leads; dropping it stops renewal
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    leading: watch::Receiver<bool>,
}

impl LeaderGuard {
    /// Resolves once renewal has failed
    pub async fn lost(&mut self) {
        let _ = self.leading.wait_for(|leading| !leading).await;
    }

    /// Give up leadership before a graceful exit
    pub async fn release(&self) -> Result<()> {
        self.renewal.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
