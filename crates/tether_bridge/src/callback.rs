//! Host callback types and the generic dispatch trampoline.
//!
//! Every script-to-host call funnels through [`dispatch`]: it resolves the
//! invoking object's bound native address (skipped for statics), then hands
//! the raw call to the host callback. The callback is fully responsible for
//! reading arguments and producing a return value or a script-visible
//! exception; no marshalling happens here.

use crate::bootstrap;
use std::ffi::c_void;
use std::sync::Arc;

use rquickjs::{Array, Ctx, IntoJs, Undefined, Value};

/// A script-to-host call as seen by a registered function, getter or setter.
pub struct NativeCall<'js> {
    pub ctx: Ctx<'js>,
    /// Bound native address of the receiver; null for static calls.
    pub this: *mut c_void,
    pub args: Vec<Value<'js>>,
    /// Opaque registration data.
    pub data: i64,
}

impl<'js> NativeCall<'js> {
    #[inline]
    pub fn arg(&self, index: usize) -> Option<&Value<'js>> {
        self.args.get(index)
    }

    #[inline]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// An `undefined` return value.
    pub fn undefined(&self) -> rquickjs::Result<Value<'js>> {
        Undefined.into_js(&self.ctx)
    }

    /// Raise a script-visible `TypeError` from inside a callback.
    pub fn throw(&self, message: &str) -> rquickjs::Error {
        match bootstrap::boundary_error(&self.ctx, message) {
            Ok(err) => self.ctx.throw(err),
            Err(err) => err,
        }
    }
}

/// A script `new` expression as seen by a registered constructor thunk.
pub struct CtorCall<'js> {
    pub ctx: Ctx<'js>,
    pub args: Vec<Value<'js>>,
    pub data: i64,
}

/// Member/static function, getter and setter callback.
pub type NativeCallback =
    Arc<dyn for<'js> Fn(NativeCall<'js>) -> rquickjs::Result<Value<'js>> + 'static>;

/// Constructor thunk: produces the native address a new instance binds to.
/// Returning null binds an addressless instance (zero-initialized when the
/// class carries an owned payload).
pub type ConstructorCallback = Arc<dyn for<'js> Fn(CtorCall<'js>) -> *mut c_void + 'static>;

/// Destructor thunk: invoked once when a host-owned binding is released.
pub type DestructorCallback = Arc<dyn Fn(*mut c_void, i64) + 'static>;

/// Wrap a closure as a [`NativeCallback`].
pub fn native_callback<F>(f: F) -> NativeCallback
where
    F: for<'js> Fn(NativeCall<'js>) -> rquickjs::Result<Value<'js>> + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`ConstructorCallback`].
pub fn constructor_callback<F>(f: F) -> ConstructorCallback
where
    F: for<'js> Fn(CtorCall<'js>) -> *mut c_void + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`DestructorCallback`].
pub fn destructor_callback<F>(f: F) -> DestructorCallback
where
    F: Fn(*mut c_void, i64) + 'static,
{
    Arc::new(f)
}

/// One registered callable slot. Records are immutable after creation and
/// stay alive for the whole engine lifetime because script-side function
/// objects capture them.
pub struct CallbackRecord {
    pub is_static: bool,
    pub callback: NativeCallback,
    pub data: i64,
}

impl CallbackRecord {
    pub fn new(is_static: bool, callback: NativeCallback, data: i64) -> Arc<Self> {
        Arc::new(Self {
            is_static,
            callback,
            data,
        })
    }
}

/// Collect the packed argument array our script-side wrappers always pass.
fn collect_args<'js>(args: &Array<'js>) -> rquickjs::Result<Vec<Value<'js>>> {
    let mut out = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        out.push(args.get::<Value>(i)?);
    }
    Ok(out)
}

/// The generic trampoline behind every registered function, getter and
/// setter. `this` is the raw receiver value; statics ignore it.
pub(crate) fn dispatch<'js>(
    ctx: Ctx<'js>,
    record: &CallbackRecord,
    this: Value<'js>,
    args: Array<'js>,
) -> rquickjs::Result<Value<'js>> {
    let this_addr = if record.is_static {
        std::ptr::null_mut()
    } else {
        let token: f64 = bootstrap::helper(&ctx, "boundAddr")?.call((this,))?;
        if token < 0.0 {
            let err = bootstrap::boundary_error(&ctx, "native call on a value that is not a bridged object")?;
            return Err(ctx.throw(err));
        }
        token as usize as *mut c_void
    };

    let call = NativeCall {
        args: collect_args(&args)?,
        ctx,
        this: this_addr,
        data: record.data,
    };
    (record.callback)(call)
}
