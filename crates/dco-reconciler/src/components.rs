//! Reusable components
//!
//! Most steps of a cluster type map the custom resource to one controlled
//! object and apply it. [`ResourceComponent`] covers that shape, including
//! conditional deletion and persistent volume claim cleanup on teardown.

use std::marker::PhantomData;

use async_trait::async_trait;
use kube::core::ApiResource;
use kube::Resource;
use serde::Serialize;
use tracing::debug;

use dco_common::Result;

use crate::actions::{create_or_update_owned, create_owned, delete_if_exists, delete_storage};
use crate::component::{
    Component, Finalized, FinalizerComponent, OwnedComponent, ReconcileResult, DEFAULT_REQUEUE,
};
use crate::context::Context;
use crate::object::{ControlledRef, Selector};

type Factory<K, T> = Box<dyn Fn(&K) -> Result<T> + Send + Sync>;
type Predicate<K> = Box<dyn Fn(&K) -> bool + Send + Sync>;
type StorageSelector<K> = Box<dyn Fn(&K) -> Selector + Send + Sync>;

/// Component producing a single controlled object of type `T`
pub struct ResourceComponent<K, T> {
    factory: Factory<K, T>,
    delete_when: Option<Predicate<K>>,
    create_only: bool,
    storage: Option<StorageSelector<K>>,
    _kind: PhantomData<fn() -> T>,
}

impl<K, T> ResourceComponent<K, T>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
    T: Resource<DynamicType = ()> + Serialize + Send + Sync + 'static,
{
    /// Apply whatever `factory` builds from the custom resource.
    ///
    /// The factory must return a named object even when the component is
    /// about to delete it, since deletion is addressed by that name.
    pub fn new(factory: impl Fn(&K) -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            delete_when: None,
            create_only: false,
            storage: None,
            _kind: PhantomData,
        }
    }

    /// Delete the object instead of applying it while `predicate` holds
    pub fn delete_when(mut self, predicate: impl Fn(&K) -> bool + Send + Sync + 'static) -> Self {
        self.delete_when = Some(Box::new(predicate));
        self
    }

    /// Create the object once and never update it
    pub fn create_only(mut self) -> Self {
        self.create_only = true;
        self
    }

    /// Delete the claims matched by `selector` before the custom resource goes
    pub fn with_storage_cleanup(
        mut self,
        selector: impl Fn(&K) -> Selector + Send + Sync + 'static,
    ) -> Self {
        self.storage = Some(Box::new(selector));
        self
    }
}

#[async_trait]
impl<K, T> Component<K> for ResourceComponent<K, T>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
    T: Resource<DynamicType = ()> + Serialize + Send + Sync + 'static,
{
    async fn reconcile(&self, ctx: &Context<K>) -> Result<ReconcileResult> {
        let desired = (self.factory)(&ctx.object)?;

        if self.delete_when.as_ref().is_some_and(|p| p(&ctx.object)) {
            delete_if_exists(ctx, &[ControlledRef::of(&desired)]).await?;
        } else if self.create_only {
            create_owned(ctx, &ctx.object, &desired).await?;
        } else {
            create_or_update_owned(ctx, &ctx.object, &desired).await?;
        }
        Ok(ReconcileResult::default())
    }

    fn as_owned(&self) -> Option<&dyn OwnedComponent> {
        Some(self)
    }

    fn as_finalizer(&self) -> Option<&dyn FinalizerComponent<K>> {
        self.storage.as_ref().map(|_| self as &dyn FinalizerComponent<K>)
    }
}

impl<K, T> OwnedComponent for ResourceComponent<K, T>
where
    K: Send + Sync,
    T: Resource<DynamicType = ()> + Send + Sync,
{
    fn kind(&self) -> ApiResource {
        ApiResource::erase::<T>(&())
    }
}

#[async_trait]
impl<K, T> FinalizerComponent<K> for ResourceComponent<K, T>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
    T: Resource<DynamicType = ()> + Serialize + Send + Sync + 'static,
{
    async fn finalize(&self, ctx: &Context<K>) -> Result<Finalized> {
        let Some(selector) = self.storage.as_ref() else {
            return Ok(Finalized::done());
        };
        let selector = selector(&ctx.object);

        let issued = delete_storage(ctx, &selector).await?;
        if issued == 0 {
            return Ok(Finalized::done());
        }
        debug!(claims = issued, "Waiting for persistent volume claims to disappear");
        Ok(Finalized::pending(ReconcileResult::requeue_after(DEFAULT_REQUEUE)))
    }
}
