//! Component contracts
//!
//! A component is one named step of a reconciler. Every component reconciles;
//! a component may additionally own a kind of object (so changes to those
//! objects retrigger the controller) and may hold a finalizer on the custom
//! resource until its cleanup completes. The reconcile loop discovers those
//! capabilities through [`Component::as_owned`] and [`Component::as_finalizer`].

use std::time::Duration;

use async_trait::async_trait;
use kube::core::ApiResource;
use kube::runtime::controller::Action;

use dco_common::Result;

use crate::context::Context;

/// Delay used when a component asks for a requeue without a deadline
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue request from a component step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Run the reconciler again soon
    pub requeue: bool,
    /// Run the reconciler again after this delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Ask for another pass soon
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Ask for another pass after `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    /// True when no further pass was requested
    pub fn is_empty(&self) -> bool {
        !self.requeue && self.requeue_after.is_none()
    }

    /// Fold another step's request into this one.
    ///
    /// `requeue` is OR'd; the soonest non-zero `requeue_after` wins.
    pub fn merge(&mut self, other: ReconcileResult) {
        self.requeue |= other.requeue;
        let other_after = other.requeue_after.filter(|d| !d.is_zero());
        self.requeue_after = match (self.requeue_after, other_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    /// Translate into the controller runtime's scheduling action
    pub fn into_action(self) -> Action {
        match self.requeue_after {
            Some(delay) => Action::requeue(delay),
            None if self.requeue => Action::requeue(DEFAULT_REQUEUE),
            None => Action::await_change(),
        }
    }
}

/// Outcome of a finalize step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Finalized {
    /// Requeue request, as for reconcile
    pub result: ReconcileResult,
    /// Cleanup finished; the finalizer may be removed
    pub done: bool,
}

impl Finalized {
    /// Cleanup finished
    pub fn done() -> Self {
        Self {
            result: ReconcileResult::default(),
            done: true,
        }
    }

    /// Cleanup still in progress
    pub fn pending(result: ReconcileResult) -> Self {
        Self {
            result,
            done: false,
        }
    }
}

/// One named step of a reconciler
#[async_trait]
pub trait Component<K: Send + Sync>: Send + Sync {
    /// Converge the objects this step is responsible for
    async fn reconcile(&self, ctx: &Context<K>) -> Result<ReconcileResult>;

    /// Owned-kind capability
    fn as_owned(&self) -> Option<&dyn OwnedComponent> {
        None
    }

    /// Finalizer capability
    fn as_finalizer(&self) -> Option<&dyn FinalizerComponent<K>> {
        None
    }
}

/// A component that produces objects of a single kind
pub trait OwnedComponent: Send + Sync {
    /// Type of the produced objects, watched so external edits retrigger
    fn kind(&self) -> ApiResource;
}

/// A component with cleanup that must finish before the custom resource goes
#[async_trait]
pub trait FinalizerComponent<K: Send + Sync>: Send + Sync {
    /// Perform (part of) the cleanup
    async fn finalize(&self, ctx: &Context<K>) -> Result<Finalized>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soonest_requeue_wins() {
        let mut result = ReconcileResult::default();
        result.merge(ReconcileResult::requeue_after(Duration::from_secs(30)));
        result.merge(ReconcileResult::requeue_after(Duration::from_secs(10)));
        result.merge(ReconcileResult::default());
        assert_eq!(result.requeue_after, Some(Duration::from_secs(10)));
        assert!(!result.requeue);
    }

    #[test]
    fn zero_delay_is_not_a_deadline() {
        let mut result = ReconcileResult::requeue_after(Duration::from_secs(30));
        result.merge(ReconcileResult::requeue_after(Duration::ZERO));
        assert_eq!(result.requeue_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn requeue_flag_is_sticky() {
        let mut result = ReconcileResult::requeue();
        result.merge(ReconcileResult::default());
        assert!(result.requeue);
        assert!(!result.is_empty());
        assert!(ReconcileResult::default().is_empty());
    }

    #[test]
    fn actions_follow_the_request() {
        assert_eq!(
            ReconcileResult::requeue_after(Duration::from_secs(10)).into_action(),
            Action::requeue(Duration::from_secs(10))
        );
        assert_eq!(
            ReconcileResult::requeue().into_action(),
            Action::requeue(DEFAULT_REQUEUE)
        );
        assert_eq!(
            ReconcileResult::default().into_action(),
            Action::await_change()
        );
    }

    #[test]
    fn finalized_constructors() {
        assert!(Finalized::done().done);
        let pending = Finalized::pending(ReconcileResult::requeue());
        assert!(!pending.done);
        assert!(pending.result.requeue);
    }
}
