//! Ordered reconciliation of child views.
//!
//! A container widget renders one child view per entry of a model list.
//! When the list changes, [`ViewList::update`] keeps the views for the
//! entries shared at the front and at the back of the old and new lists,
//! destroys the old views in between and creates views for the new entries
//! in between. Appends, truncations and single removals therefore touch
//! only what changed; a reordering in the middle rebuilds the middle.
//!
//! Entries are compared with `PartialEq`, which for [`ModelHandle`]s is
//! identity.
//!
//! [`ModelHandle`]: crate::model::ModelHandle

use futures::future::BoxFuture;

use crate::error::Result;

type CreateFn<M, V> = Box<dyn FnMut(M, usize) -> BoxFuture<'static, Result<V>> + Send>;
type RemoveFn<V> = Box<dyn FnMut(V) + Send>;

/// Views kept aligned with an ordered list of models.
pub struct ViewList<M, V> {
    models: Vec<M>,
    views: Vec<V>,
    create: CreateFn<M, V>,
    remove: RemoveFn<V>,
}

impl<M, V> ViewList<M, V>
where
    M: PartialEq + Clone,
    V: Clone,
{
    /// `create` builds the view for a model at an index of the new list;
    /// `remove` destroys a view.
    pub fn new<C, R>(create: C, remove: R) -> Self
    where
        C: FnMut(M, usize) -> BoxFuture<'static, Result<V>> + Send + 'static,
        R: FnMut(V) + Send + 'static,
    {
        Self {
            models: Vec::new(),
            views: Vec::new(),
            create: Box::new(create),
            remove: Box::new(remove),
        }
    }

    pub fn models(&self) -> &[M] {
        &self.models
    }

    pub fn views(&self) -> &[V] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Reconcile against `new_models` and return the views in order.
    ///
    /// If a view fails to build, the views created so far are kept, the
    /// list records only the models that have views, and the error is
    /// returned.
    pub async fn update(&mut self, new_models: Vec<M>) -> Result<Vec<V>> {
        let old_len = self.models.len();
        let new_len = new_models.len();

        let prefix = self
            .models
            .iter()
            .zip(&new_models)
            .take_while(|(old, new)| old == new)
            .count();
        let suffix = self.models[prefix..]
            .iter()
            .rev()
            .zip(new_models[prefix..].iter().rev())
            .take_while(|(old, new)| old == new)
            .count();

        let tail_views = self.views.split_off(old_len - suffix);
        for view in self.views.split_off(prefix) {
            (self.remove)(view);
        }
        self.models.truncate(prefix);

        let mut result = Ok(());
        for (index, model) in new_models
            .iter()
            .enumerate()
            .take(new_len - suffix)
            .skip(prefix)
        {
            match (self.create)(model.clone(), index).await {
                Ok(view) => {
                    self.views.push(view);
                    self.models.push(model.clone());
                }
                Err(err) => {
                    log::error!("Could not create view at index {}: {}", index, err);
                    result = Err(err);
                    break;
                }
            }
        }

        self.views.extend(tail_views);
        self.models
            .extend(new_models[new_len - suffix..].iter().cloned());

        result.map(|()| self.views.clone())
    }

    /// Destroy every view and forget every model.
    pub fn remove(&mut self) {
        for view in self.views.drain(..) {
            (self.remove)(view);
        }
        self.models.clear();
    }

    /// Forget every view without destroying it.
    pub fn dispose(&mut self) {
        self.views.clear();
        self.models.clear();
    }
}
