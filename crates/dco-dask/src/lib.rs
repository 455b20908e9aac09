//! DaskCluster support for the distributed compute operator
//!
//! Declares the [`DaskCluster`] custom resource and the ordered components
//! that turn one into a running Dask scheduler and worker pool.

pub mod autoscaler;
pub mod client_ports;
pub mod config_map;
pub mod crd;
pub mod metadata;
pub mod network_policy;
pub mod service;
pub mod service_account;
pub mod stateful_set;
pub mod status;

use std::sync::Arc;

use dco_common::{EventPublisher, Result};
use dco_reconciler::{ObjectClient, Reconciler, ReconcilerBuilder};

pub use crd::{DaskCluster, DaskClusterSpec, DaskClusterStatus};

use crate::metadata::{COMPONENT_SCHEDULER, COMPONENT_WORKER};

/// Controller name used in spans, events and finalizers
pub const CONTROLLER_NAME: &str = "daskcluster";

/// Every DaskCluster component, in execution order
pub fn builder(client: Arc<dyn ObjectClient>, events: Arc<dyn EventPublisher>) -> ReconcilerBuilder<DaskCluster> {
    let meta = metadata::provider();
    Reconciler::builder(client)
        .controller_name(CONTROLLER_NAME)
        .with_events(events)
        .component("serviceaccount", service_account::component(meta.clone()))
        .component("configmap-keytab", config_map::keytab(meta.clone()))
        .component("service-scheduler", service::component(meta.clone(), COMPONENT_SCHEDULER))
        .component("service-worker", service::component(meta.clone(), COMPONENT_WORKER))
        .component("service-proxy", client_ports::service(meta.clone()))
        .component(
            "networkpolicy-scheduler",
            network_policy::component(meta.clone(), COMPONENT_SCHEDULER),
        )
        .component(
            "networkpolicy-worker",
            network_policy::component(meta.clone(), COMPONENT_WORKER),
        )
        .component("networkpolicy-proxy", client_ports::network_policy(meta.clone()))
        .component("statefulset-scheduler", stateful_set::scheduler(meta.clone()))
        .component("statefulset-worker", stateful_set::worker(meta.clone()))
        .component("horizontalpodautoscaler", autoscaler::component(meta.clone()))
        .component("statusupdate", status::ClusterStatusUpdate::new(meta))
}

/// The DaskCluster reconciler
pub fn reconciler(client: Arc<dyn ObjectClient>, events: Arc<dyn EventPublisher>) -> Result<Reconciler<DaskCluster>> {
    builder(client, events).build()
}
