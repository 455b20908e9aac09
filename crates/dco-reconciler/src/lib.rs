//! Declarative reconciliation of Kubernetes custom resources
//!
//! A [`Reconciler`] drives one custom resource kind through an ordered list of
//! named [`Component`]s. Components build desired objects and converge them
//! with the ownership-aware [`actions`], which consult the [`PatchEngine`] so
//! unchanged objects are never rewritten. Components holding cleanup state keep
//! a finalizer on the custom resource until their teardown completes.

pub mod actions;
pub mod builder;
pub mod client;
pub mod component;
pub mod components;
pub mod context;
pub mod object;
pub mod patch;
pub mod reconciler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod fixtures;

pub use builder::ReconcilerBuilder;
pub use client::{KubeObjectClient, ObjectClient};
pub use component::{
    Component, Finalized, FinalizerComponent, OwnedComponent, ReconcileResult, DEFAULT_REQUEUE,
};
pub use components::ResourceComponent;
pub use context::Context;
pub use object::{ControlledRef, ObjectKey, Selector};
pub use patch::{CalculateOption, PatchEngine, PatchResult};
pub use reconciler::{Reconciler, RunConfig, WATCH_TIMEOUT_SECS};
