//! Object bridge: the identity map between host addresses and script objects.
//!
//! Invariant: for a given bound address at most one live script object exists
//! at any time; repeated bridging of the same address yields the same object.
//! The script side holds the association weakly (a `WeakRef` per address in
//! the support table), so the map keeps neither side alive. Release is driven
//! by the engine's finalization registry, or eagerly at teardown.

use crate::bootstrap;
use crate::callback::{CtorCall, DestructorCallback};
use crate::error::{BridgeError, Result};
use crate::registry::{ClassId, ClassRegistry, RecordView};

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;

use rquickjs::{Array, Ctx, IntoJs, Object, Undefined, Value};

/// Host-side state of one bound object, keyed by its bound address.
///
/// `payload` distinguishes the two ownership modes: `Some` means the bridge
/// owns a private copy of the instance bytes (freed on release), `None`
/// means the address points at host-managed memory and the destructor thunk
/// runs on release.
pub(crate) struct BoundObject {
    pub class_id: ClassId,
    pub payload: Option<Box<[u8]>>,
    pub destructor: Option<DestructorCallback>,
    pub data: i64,
}

/// How the native address of a new binding is obtained.
pub(crate) enum AddrSource<'js> {
    /// Host-initiated bridging of an existing native object.
    Host(*mut c_void),
    /// Script-initiated `new`: the constructor thunk produces the address.
    Script(Vec<Value<'js>>),
}

#[derive(Clone, Default)]
pub(crate) struct ObjectBridge {
    map: Rc<RefCell<HashMap<usize, BoundObject>>>,
}

impl ObjectBridge {
    /// Find the canonical script object for `ptr`, creating it on first
    /// reference. A null pointer maps to `undefined`. A hit is a non-owning
    /// alias: reference counts are untouched.
    ///
    /// # Safety
    /// For classes with a payload size, callers must guarantee `ptr` is
    /// either null or readable for at least that many bytes.
    pub fn find_or_add<'js>(
        &self,
        ctx: &Ctx<'js>,
        registry: &ClassRegistry,
        class_id: ClassId,
        ptr: *mut c_void,
    ) -> Result<Value<'js>> {
        if ptr.is_null() {
            return Ok(Undefined.into_js(ctx)?);
        }
        let record = registry
            .record_view(class_id)
            .ok_or(BridgeError::UnknownClassId { class_id })?;

        if self.map.borrow().contains_key(&(ptr as usize)) {
            let existing: Value = bootstrap::helper(ctx, "find")?.call((ptr as usize as f64,))?;
            if !existing.is_null() && !existing.is_undefined() {
                return Ok(existing);
            }
            // The previous tenant died but its finalization has not run yet;
            // fall through and rebind the address.
        }
        Ok(self.bind_instance(ctx, &record, AddrSource::Host(ptr))?)
    }

    /// Bind a new instance of `record`'s class and register it in the
    /// identity map. Shared tail of both the host path (`find_or_add`) and
    /// the script path (`new ClassName(...)`).
    pub fn bind_instance<'js>(
        &self,
        ctx: &Ctx<'js>,
        record: &RecordView,
        source: AddrSource<'js>,
    ) -> rquickjs::Result<Value<'js>> {
        let raw = match source {
            AddrSource::Host(ptr) => ptr,
            AddrSource::Script(args) => match &record.constructor {
                Some(thunk) => thunk(CtorCall {
                    ctx: ctx.clone(),
                    args,
                    data: record.data,
                }),
                None => std::ptr::null_mut(),
            },
        };

        // Payload-owned classes get a private copy of the instance bytes;
        // the source may be discarded by the host immediately afterwards.
        let (addr, payload) = if record.payload_size > 0 {
            let mut buffer = vec![0u8; record.payload_size].into_boxed_slice();
            if !raw.is_null() {
                // Safety: the registration contract guarantees `payload_size`
                // readable bytes behind a non-null source address.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        raw as *const u8,
                        buffer.as_mut_ptr(),
                        record.payload_size,
                    );
                }
            }
            let addr = buffer.as_mut_ptr() as *mut c_void;
            (addr, Some(buffer))
        } else {
            (raw, None)
        };

        let instance = Object::new(ctx.clone())?;
        let prototype: Value = bootstrap::helper(ctx, "protoOf")?.call((record.class_id,))?;
        bootstrap::helper(ctx, "setProto")?.call::<_, ()>((instance.clone(), prototype))?;
        bootstrap::helper(ctx, "tag")?.call::<_, ()>((instance.clone(), addr as usize as f64))?;

        self.map.borrow_mut().insert(
            addr as usize,
            BoundObject {
                class_id: record.class_id,
                payload,
                destructor: record.destructor.clone(),
                data: record.data,
            },
        );
        tracing::trace!(class_id = record.class_id, addr = addr as usize, "bound object");
        instance.into_js(ctx)
    }

    /// Finalization callback: the script object bound to `addr` was
    /// collected. Skipped when the address has already been rebound to a new
    /// live object (the release of the old tenancy transfers to the new one).
    pub fn finalize(&self, ctx: &Ctx<'_>, addr: usize) {
        let rebound = bootstrap::helper(ctx, "find")
            .and_then(|find| find.call::<_, Value>((addr as f64,)))
            .map(|v| !v.is_null() && !v.is_undefined())
            .unwrap_or(false);
        if rebound {
            return;
        }
        // End the map borrow before running release: destructor thunks may
        // re-enter the bridge.
        let bound = self.map.borrow_mut().remove(&addr);
        if let Some(bound) = bound {
            tracing::trace!(class_id = bound.class_id, addr, "finalizing bound object");
            release(bound, addr);
        }
        if let Ok(forget) = bootstrap::helper(ctx, "forget") {
            let _ = forget.call::<_, ()>((addr as f64,));
        }
    }

    /// Eagerly release every remaining binding. Runs at engine teardown
    /// while the context is still valid, so host memory reachable only from
    /// script code does not outlive the engine. Finalizers that fire later
    /// find the map empty and do nothing.
    pub fn release_all(&self, ctx: &Ctx<'_>) {
        let drained: Vec<(usize, BoundObject)> = self.map.borrow_mut().drain().collect();
        let released = drained.len();
        for (addr, bound) in drained {
            release(bound, addr);
        }
        if let Ok(clear) = bootstrap::helper(ctx, "clearObjects") {
            let _ = clear.call::<_, ()>(());
        }
        if released > 0 {
            tracing::debug!(released, "released remaining bound objects at teardown");
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.map.borrow().contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }
}

/// Release one binding exactly once: drop the owned payload copy, or hand
/// the raw address back to the destructor thunk.
fn release(bound: BoundObject, addr: usize) {
    match bound.payload {
        Some(buffer) => drop(buffer),
        None => {
            if let Some(destructor) = &bound.destructor {
                destructor(addr as *mut c_void, bound.data);
            }
        }
    }
}

/// Construction protocol entry point for script `new` expressions.
pub(crate) fn construct_from_script<'js>(
    objects: &ObjectBridge,
    registry: &ClassRegistry,
    ctx: Ctx<'js>,
    class_id: ClassId,
    args: Array<'js>,
) -> rquickjs::Result<Value<'js>> {
    let record = match registry.record_view(class_id) {
        Some(record) => record,
        None => {
            let err = bootstrap::boundary_error(&ctx, "constructor for an unregistered class")?;
            return Err(ctx.throw(err));
        }
    };
    let mut call_args = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        call_args.push(args.get::<Value>(i)?);
    }
    objects.bind_instance(&ctx, &record, AddrSource::Script(call_args))
}
