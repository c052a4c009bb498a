//! Sequence helpers: apply a function across a sequence via the runtime
//!
//! This module provides:
//! - Fan-out of a `(K, V)` sequence through a task group on a pool, with a
//!   joined error, and a fire-and-forget variant
//! - A bounded-channel adapter for sequences produced elsewhere
//! - An indexed slice transform with optional stop-on-first-error
//!
//! The helpers pay a launch per item; they earn their keep when the
//! per-item work is dominated by I/O or real computation, not for
//! memory-bound arithmetic a plain loop would vectorise.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::context::Ctx;
use crate::group::{ErrorSet, GoOptions, GroupBuilder, GroupError, IndexedError, TaskGroup};
use crate::pool::WorkerPool;

/// Options for the fan-out helpers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqOptions {
    /// Cancel the derived context on the first item error, so remaining
    /// in-flight items observing it exit promptly. Items not yet launched
    /// are rejected and reported under their position.
    pub cancel_on_err: bool,
}

fn build_group(ctx: &Ctx, pool: &WorkerPool, options: SeqOptions) -> (TaskGroup, Ctx) {
    let mut builder = GroupBuilder::new().pool(pool.clone());
    let launch_ctx = if options.cancel_on_err {
        let (derived, canceller) = ctx.with_cancel();
        builder = builder.cancel_on_err(canceller);
        derived
    } else {
        ctx.clone()
    };
    (builder.build(), launch_ctx)
}

/// Record a launch rejection under the item's position.
fn rejection(position: usize, err: GroupError) -> IndexedError {
    IndexedError {
        index: Some(position),
        error: anyhow::Error::new(err),
    }
}

fn merge(result: Result<(), ErrorSet>, mut rejected: Vec<IndexedError>) -> Result<(), ErrorSet> {
    match result {
        Ok(()) if rejected.is_empty() => Ok(()),
        Ok(()) => Err(ErrorSet::from_entries(rejected)),
        Err(set) => {
            let mut entries = set.into_entries();
            entries.append(&mut rejected);
            Err(ErrorSet::from_entries(entries))
        }
    }
}

/// Apply `f` to every `(key, value)` item through a group on `pool` and
/// wait for the joined outcome.
pub async fn for_each<K, V, I, F, Fut>(
    ctx: &Ctx,
    pool: &WorkerPool,
    items: I,
    options: SeqOptions,
    f: F,
) -> Result<(), ErrorSet>
where
    K: Send + 'static,
    V: Send + 'static,
    I: IntoIterator<Item = (K, V)>,
    F: Fn(Ctx, K, V) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (group, launch_ctx) = build_group(ctx, pool, options);
    let mut rejected = Vec::new();

    for (position, (key, value)) in items.into_iter().enumerate() {
        let f = f.clone();
        let mut slot = Some((key, value));
        let launch = group
            .go(&launch_ctx, move |c| {
                let f = f.clone();
                let taken = slot.take();
                async move {
                    match taken {
                        Some((key, value)) => f(c, key, value).await,
                        // a retried launch has nothing left to do
                        None => Ok(()),
                    }
                }
            })
            .await;
        if let Err(err) = launch {
            rejected.push(rejection(position, err));
            break;
        }
    }

    merge(group.wait(ctx).await, rejected)
}

/// Fire-and-forget variant of [`for_each`]: launches the fan-out and
/// returns immediately. Item errors are logged; when
/// `cancel_when_done` is set the derived context is cancelled once every
/// launch finished.
pub fn spawn_each<K, V, I, F, Fut>(
    ctx: &Ctx,
    pool: &WorkerPool,
    items: I,
    options: SeqOptions,
    cancel_when_done: Option<crate::context::Canceller>,
    f: F,
) where
    K: Send + 'static,
    V: Send + 'static,
    I: IntoIterator<Item = (K, V)> + Send + 'static,
    I::IntoIter: Send,
    F: Fn(Ctx, K, V) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let ctx = ctx.clone();
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(errors) = for_each(&ctx, &pool, items, options, f).await {
            tracing::warn!(failures = errors.len(), error = %errors, "sequence fan-out failed");
        }
        if let Some(canceller) = cancel_when_done {
            canceller.cancel();
        }
    });
}

/// Drain a bounded channel as the item sequence, applying `f` to each
/// received `(key, value)` until the channel closes or `ctx` cancels, then
/// wait for the joined outcome.
pub async fn for_each_channel<K, V, F, Fut>(
    ctx: &Ctx,
    pool: &WorkerPool,
    mut items: mpsc::Receiver<(K, V)>,
    options: SeqOptions,
    f: F,
) -> Result<(), ErrorSet>
where
    K: Send + 'static,
    V: Send + 'static,
    F: Fn(Ctx, K, V) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (group, launch_ctx) = build_group(ctx, pool, options);
    let mut rejected = Vec::new();
    let mut position = 0usize;

    loop {
        let item = tokio::select! {
            received = items.recv() => received,
            _ = ctx.cancelled() => None,
        };
        let Some((key, value)) = item else { break };

        let f = f.clone();
        let mut slot = Some((key, value));
        let launch = group
            .go(&launch_ctx, move |c| {
                let f = f.clone();
                let taken = slot.take();
                async move {
                    match taken {
                        Some((key, value)) => f(c, key, value).await,
                        None => Ok(()),
                    }
                }
            })
            .await;
        if let Err(err) = launch {
            rejected.push(rejection(position, err));
            break;
        }
        position += 1;
    }

    merge(group.wait(ctx).await, rejected)
}

/// Borrow a map's entries as an owned `(K, V)` sequence for the helpers.
pub fn entries<K, V>(map: &HashMap<K, V>) -> Vec<(K, V)>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Pair every element with its position.
pub fn indexed<T>(items: Vec<T>) -> impl Iterator<Item = (usize, T)> {
    items.into_iter().enumerate()
}

/// Transform a vector through `f(ctx, index, item)` with indexed error
/// reporting.
///
/// On success the output preserves input order. Any failure returns the
/// error set instead; with `cancel_on_err` the first failure also cancels
/// the remaining in-flight items.
pub async fn try_map<T, U, F, Fut>(
    ctx: &Ctx,
    pool: &WorkerPool,
    items: Vec<T>,
    options: SeqOptions,
    f: F,
) -> Result<Vec<U>, ErrorSet>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(Ctx, usize, T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
{
    let (group, launch_ctx) = build_group(ctx, pool, options);
    let results: Arc<Mutex<Vec<Option<U>>>> =
        Arc::new(Mutex::new((0..items.len()).map(|_| None).collect()));
    let mut rejected = Vec::new();

    for (position, item) in items.into_iter().enumerate() {
        let f = f.clone();
        let results = results.clone();
        let mut slot = Some(item);
        let launch = group
            .go_with(
                &launch_ctx,
                GoOptions {
                    index: Some(position),
                    backoff: None,
                },
                move |c| {
                    let f = f.clone();
                    let results = results.clone();
                    let taken = slot.take();
                    async move {
                        match taken {
                            Some(item) => {
                                let value = f(c, position, item).await?;
                                results.lock()[position] = Some(value);
                                Ok(())
                            }
                            None => Ok(()),
                        }
                    }
                },
            )
            .await;
        if let Err(err) = launch {
            rejected.push(rejection(position, err));
            break;
        }
    }

    merge(group.wait(ctx).await, rejected)?;

    let collected: Option<Vec<U>> = results.lock().drain(..).collect();
    match collected {
        Some(values) => Ok(values),
        // a hole with no recorded error cannot happen; report it as one
        None => Err(ErrorSet::from_entries(vec![IndexedError {
            index: None,
            error: anyhow::anyhow!("transform produced no value for an item"),
        }])),
    }
}
