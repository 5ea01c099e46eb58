//! Script function handle table.
//!
//! Wraps script functions the host wants to call back later behind stable
//! small integer indices. The index (plus a generation stamp) is cached on
//! the function object itself, so re-acquiring the same function is O(1).
//! Indices are reused after release to bound growth under churn.
//!
//! This is the one bridge structure safe for concurrent host-thread access:
//! a single table-wide lock serializes it so other threads may release
//! handles during cross-thread teardown. The script-side function references
//! live in the support table and are reclaimed on the engine thread the next
//! time it enters the table (or at teardown).

use crate::bootstrap;
use crate::error::{BridgeError, Result};

use std::sync::Mutex;

use rquickjs::{Array, Ctx, FromJs, Function, Value};

/// Stable handle to an acquired script function. Plain data; the host owns
/// the lifetime and must release it explicitly, script garbage collection
/// never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionHandle {
    index: u32,
}

impl FunctionHandle {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

struct Slot {
    generation: u32,
}

#[derive(Default)]
struct TableInner {
    slots: Vec<Option<Slot>>,
    next_generation: u32,
    /// Indices released off-thread; their script-side references are dropped
    /// on the engine thread at the next opportunity.
    pending_reclaim: Vec<u32>,
}

#[derive(Default)]
pub struct FunctionTable {
    inner: Mutex<TableInner>,
}

impl FunctionTable {
    /// Acquire a handle for `function`, reusing the cached slot when the
    /// function already carries one. A cached slot whose generation no
    /// longer matches (the handle was released, and possibly reassigned to a
    /// different function) is stale: a fresh slot is assigned instead of
    /// silently resurrecting the released handle.
    pub fn acquire<'js>(&self, ctx: &Ctx<'js>, function: Function<'js>) -> Result<FunctionHandle> {
        let cached: Array = bootstrap::helper(ctx, "cachedSlot")?.call((function.clone(),))?;
        let cached_index: f64 = cached.get(0)?;
        let cached_generation: f64 = cached.get(1)?;

        let mut inner = self.inner.lock().expect("function table lock poisoned");
        self.reclaim_locked(ctx, &mut inner);

        if cached_index >= 0.0 {
            if let Some(Some(slot)) = inner.slots.get(cached_index as usize) {
                if slot.generation == cached_generation as u32 {
                    return Ok(FunctionHandle {
                        index: cached_index as u32,
                    });
                }
            }
        }

        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let index = match inner.slots.iter().position(Option::is_none) {
            Some(free) => {
                inner.slots[free] = Some(Slot { generation });
                free as u32
            }
            None => {
                inner.slots.push(Some(Slot { generation }));
                (inner.slots.len() - 1) as u32
            }
        };
        drop(inner);

        bootstrap::helper(ctx, "storeFn")?.call::<_, ()>((index, function.clone()))?;
        bootstrap::helper(ctx, "cacheSlot")?.call::<_, ()>((function, index, generation))?;
        tracing::trace!(index, generation, "acquired function handle");
        Ok(FunctionHandle { index })
    }

    /// Restore the callable behind `handle`.
    pub fn get<'js>(&self, ctx: &Ctx<'js>, handle: FunctionHandle) -> Result<Function<'js>> {
        {
            let inner = self.inner.lock().expect("function table lock poisoned");
            match inner.slots.get(handle.index as usize) {
                Some(Some(_)) => {}
                _ => {
                    return Err(BridgeError::StaleFunctionHandle {
                        index: handle.index,
                    })
                }
            }
        }
        let function: Value = bootstrap::helper(ctx, "fnAt")?.call((handle.index,))?;
        if function.is_undefined() {
            return Err(BridgeError::StaleFunctionHandle {
                index: handle.index,
            });
        }
        Ok(Function::from_js(ctx, function)?)
    }

    /// Release `handle`, marking its slot reusable. Callable from any host
    /// thread; the script-side reference is reclaimed on the engine thread.
    pub fn release(&self, handle: FunctionHandle) -> bool {
        let mut guard = self.inner.lock().expect("function table lock poisoned");
        let inner = &mut *guard;
        match inner.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                inner.pending_reclaim.push(handle.index);
                tracing::trace!(index = handle.index, "released function handle");
                true
            }
            _ => false,
        }
    }

    /// Drop script-side references for handles released off-thread. Invoked
    /// on the engine thread (ticks and table entry points).
    pub fn reclaim(&self, ctx: &Ctx<'_>) {
        let mut inner = self.inner.lock().expect("function table lock poisoned");
        self.reclaim_locked(ctx, &mut inner);
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().expect("function table lock poisoned");
        inner.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Drop every handle and script-side reference. Teardown only.
    pub fn clear(&self, ctx: &Ctx<'_>) {
        let mut inner = self.inner.lock().expect("function table lock poisoned");
        let live = inner.slots.iter().filter(|slot| slot.is_some()).count();
        inner.slots.clear();
        inner.pending_reclaim.clear();
        if let Ok(clear) = bootstrap::helper(ctx, "clearFns") {
            let _ = clear.call::<_, ()>(());
        }
        if live > 0 {
            tracing::debug!(live, "cleared cached function handles at teardown");
        }
    }

    fn reclaim_locked(&self, ctx: &Ctx<'_>, inner: &mut TableInner) {
        for index in inner.pending_reclaim.drain(..) {
            // The slot may have been reassigned only after reclamation, so
            // the stored reference still belongs to the released handle.
            if let Ok(drop_fn) = bootstrap::helper(ctx, "dropFn") {
                let _ = drop_fn.call::<_, ()>((index,));
            }
        }
    }
}
