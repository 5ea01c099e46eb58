//! Engine lifecycle: context construction, global bootstrap, evaluation,
//! cooperative ticking and orderly teardown.
//!
//! One `ScriptEngine` owns one execution context. The context, class
//! registry, object bridge and callback dispatch must only be entered from
//! the thread that owns the engine; the function handle table is the one
//! structure other host threads may touch.

use crate::bootstrap;
use crate::callback::{ConstructorCallback, DestructorCallback, NativeCallback};
use crate::error::{BridgeError, Result};
use crate::handle::{FunctionHandle, FunctionTable};
use crate::inspector::DebugSession;
use crate::object::ObjectBridge;
use crate::registry::{ClassId, ClassRegistry};

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rquickjs::{Context, Ctx, FromJs, Function, Runtime, Value};
use serde::{Deserialize, Serialize};

/// Process-wide engine platform state. Initialized at most once regardless
/// of how many engines a process creates.
static PLATFORM_INIT: OnceCell<()> = OnceCell::new();

/// Idempotent process-wide initialization guard.
pub fn ensure_platform_init() {
    PLATFORM_INIT.get_or_init(|| {
        tracing::info!("tether script platform initialized");
    });
}

/// Bootstrap `__tetherEvalScript`: compile and run `source`, returning its
/// value. Free-standing so its `'js` ties the context argument to the
/// returned value.
fn bootstrap_eval_script<'js>(
    ctx: Ctx<'js>,
    source: String,
    origin: String,
) -> rquickjs::Result<Value<'js>> {
    tracing::trace!(origin = origin.as_str(), "bootstrap eval request");
    ctx.eval::<Value, _>(source)
}

/// Bootstrap `__tetherSetPromiseRejectCallback`: forward `hook` to the
/// support-table installer. Free-standing for the same lifetime reason.
fn set_promise_reject_callback<'js>(
    ctx: Ctx<'js>,
    hook: Function<'js>,
) -> rquickjs::Result<()> {
    bootstrap::helper(&ctx, "setOnRejected")?.call::<_, ()>((hook,))
}

/// Tunables applied to a fresh runtime. All best-effort hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Hard heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// Allocation threshold that triggers a collection cycle.
    pub gc_threshold: Option<usize>,
    /// Native stack budget for script execution, in bytes.
    pub max_stack_size: Option<usize>,
}

impl EngineOptions {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// State shared between the engine and the script-side adapters it installs.
pub(crate) struct EngineShared {
    last_exception: RefCell<Option<String>>,
    disposing: Cell<bool>,
    general_destructor: RefCell<Option<DestructorCallback>>,
}

impl EngineShared {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            last_exception: RefCell::new(None),
            disposing: Cell::new(false),
            general_destructor: RefCell::new(None),
        })
    }

    #[inline]
    pub fn is_disposing(&self) -> bool {
        self.disposing.get()
    }
}

/// The single execution context plus every bridge structure tied to it.
///
/// Lifecycle is `new` → running → drop; disposal order inside `drop` is
/// load-bearing, see the comments there.
pub struct ScriptEngine {
    inspector: Option<DebugSession>,
    functions: Arc<FunctionTable>,
    registry: ClassRegistry,
    objects: ObjectBridge,
    shared: Rc<EngineShared>,
    context: Context,
    runtime: Runtime,
}

impl ScriptEngine {
    pub fn new(options: EngineOptions) -> Result<Self> {
        ensure_platform_init();

        let runtime = Runtime::new()?;
        if let Some(limit) = options.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(threshold) = options.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        if let Some(stack) = options.max_stack_size {
            runtime.set_max_stack_size(stack);
        }
        let context = Context::full(&runtime)?;

        let shared = EngineShared::new();
        let registry = ClassRegistry::new(shared.clone());
        let objects = ObjectBridge::default();

        context.with(|ctx| -> rquickjs::Result<()> {
            let bridge = objects.clone();
            let finalize = Function::new(ctx.clone(), move |ctx: Ctx, addr: f64| {
                bridge.finalize(&ctx, addr as usize);
            })?;
            bootstrap::install(&ctx, finalize)?;

            let eval_script = Function::new(ctx.clone(), bootstrap_eval_script)?;
            ctx.globals().set("__tetherEvalScript", eval_script)?;

            let set_reject = Function::new(ctx.clone(), set_promise_reject_callback)?;
            ctx.globals()
                .set("__tetherSetPromiseRejectCallback", set_reject)?;
            Ok(())
        })?;

        tracing::info!("script engine initialized");
        Ok(Self {
            inspector: None,
            functions: Arc::new(FunctionTable::default()),
            registry,
            objects,
            shared,
            context,
            runtime,
        })
    }

    /// Compile and run `source`. On failure the exception text (prefixed
    /// with `origin`) is recorded and retrievable via [`last_exception`];
    /// the previously stored evaluation result is left untouched. On
    /// success the resulting value is stored for later retrieval.
    ///
    /// [`last_exception`]: ScriptEngine::last_exception
    pub fn eval(&self, source: &str, origin: &str) -> Result<()> {
        let origin = if origin.is_empty() { "<eval>" } else { origin };
        self.context.with(|ctx| {
            let evaluated: std::result::Result<Value, rquickjs::Error> = ctx.eval(source);
            match evaluated {
                Ok(value) => {
                    bootstrap::helper(&ctx, "storeResult")?.call::<_, ()>((value,))?;
                    Ok(())
                }
                Err(rquickjs::Error::Exception) => {
                    let exception = ctx.catch();
                    let text = format!(
                        "{}: {}",
                        origin,
                        bootstrap::describe_exception(&ctx, exception)
                    );
                    tracing::debug!(error = text.as_str(), "evaluation failed");
                    *self.shared.last_exception.borrow_mut() = Some(text.clone());
                    Err(BridgeError::Script(text))
                }
                Err(other) => {
                    let text = format!("{}: {}", origin, other);
                    *self.shared.last_exception.borrow_mut() = Some(text.clone());
                    Err(BridgeError::Script(text))
                }
            }
        })
    }

    /// Exception text recorded by the most recent failed evaluation.
    pub fn last_exception(&self) -> Option<String> {
        self.shared.last_exception.borrow().clone()
    }

    /// Register a class. Idempotent on `name`; see the registry for the
    /// full contract. When `destructor` is absent the engine-wide general
    /// destructor (if any) is attached instead.
    #[allow(clippy::too_many_arguments)]
    pub fn register_class(
        &self,
        name: &str,
        base: Option<ClassId>,
        constructor: Option<ConstructorCallback>,
        destructor: Option<DestructorCallback>,
        data: i64,
        payload_size: usize,
    ) -> Result<ClassId> {
        let destructor = destructor.or_else(|| self.shared.general_destructor.borrow().clone());
        self.context.with(|ctx| {
            self.registry.register_class(
                &ctx,
                &self.objects,
                name,
                base,
                constructor,
                destructor,
                data,
                payload_size,
            )
        })
    }

    /// Fallback destructor for classes registered without one.
    pub fn set_general_destructor(&self, destructor: DestructorCallback) {
        *self.shared.general_destructor.borrow_mut() = Some(destructor);
    }

    pub fn register_function(
        &self,
        class_id: ClassId,
        name: &str,
        is_static: bool,
        callback: NativeCallback,
        data: i64,
    ) -> Result<()> {
        self.context.with(|ctx| {
            self.registry
                .register_function(&ctx, class_id, name, is_static, callback, data)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register_property(
        &self,
        class_id: ClassId,
        name: &str,
        is_static: bool,
        getter: NativeCallback,
        getter_data: i64,
        setter: Option<NativeCallback>,
        setter_data: i64,
        dont_delete: bool,
    ) -> Result<()> {
        self.context.with(|ctx| {
            self.registry.register_property(
                &ctx,
                class_id,
                name,
                is_static,
                getter,
                getter_data,
                setter,
                setter_data,
                dont_delete,
            )
        })
    }

    /// Install a process-global callable visible to script code.
    pub fn set_global_function(
        &self,
        name: &str,
        callback: NativeCallback,
        data: i64,
    ) -> Result<()> {
        self.context
            .with(|ctx| self.registry.set_global_function(&ctx, name, callback, data))
    }

    /// Enter the engine's context and hand a [`BridgeScope`] to `f` for
    /// operations that produce or consume script values.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(BridgeScope<'js>) -> R,
    {
        self.context.with(|ctx| {
            f(BridgeScope {
                ctx,
                registry: self.registry.clone(),
                objects: self.objects.clone(),
                functions: self.functions.clone(),
            })
        })
    }

    /// Shared handle to the function table, for host threads that need to
    /// release cached script-function handles without entering the engine.
    pub fn function_table(&self) -> Arc<FunctionTable> {
        self.functions.clone()
    }

    /// Forward a memory-pressure hint to the collector. Best-effort.
    pub fn low_memory_notification(&self) {
        tracing::debug!("low memory notification");
        self.runtime.run_gc();
    }

    /// Number of live bridged objects. Diagnostic.
    pub fn bound_object_count(&self) -> usize {
        self.objects.len()
    }

    /// Whether `ptr` currently has a bound script object. Diagnostic.
    pub fn has_bound_object(&self, ptr: *mut c_void) -> bool {
        self.objects.contains(ptr as usize)
    }

    /// Lazily create the debug session. A second call with a live session
    /// is a no-op.
    pub fn create_inspector(&mut self, port: u16) {
        if self.inspector.is_none() {
            self.inspector = Some(DebugSession::bind(port));
        }
    }

    pub fn destroy_inspector(&mut self) {
        self.inspector = None;
    }

    /// Drain pending engine work to quiescence, then forward one tick to
    /// the debug session. Returns the session's continuation signal, or
    /// `true` when no session is attached. Polling, never blocking: the
    /// host's own loop must call this periodically.
    pub fn inspector_tick(&mut self) -> bool {
        self.context.with(|ctx| self.functions.reclaim(&ctx));
        self.drain_jobs();
        match &mut self.inspector {
            Some(session) => session.tick(),
            None => true,
        }
    }

    /// Run queued jobs until none remain. A job that raises is reported to
    /// the installed promise-rejection hook and logged; draining continues.
    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => self.context.with(|ctx| {
                    let exception = ctx.catch();
                    let text = bootstrap::describe_exception(&ctx, exception.clone());
                    tracing::warn!(error = text.as_str(), "pending job raised");
                    let hook: rquickjs::Result<Value> =
                        (|| bootstrap::helper(&ctx, "rejectedHook")?.call(()))();
                    if let Ok(hook) = hook {
                        if let Ok(hook) = Function::from_js(&ctx, hook) {
                            if hook.call::<_, ()>((exception,)).is_err() {
                                let _ = ctx.catch();
                                tracing::warn!("promise rejection hook raised");
                            }
                        }
                    }
                }),
            }
        }
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        // Disposal order is strict: debug session, cached function handles,
        // bridged objects (while the context is still valid), queued jobs,
        // then the registry's records. The context and runtime fields drop
        // last, in declaration order.
        self.shared.disposing.set(true);
        tracing::info!("disposing script engine");
        self.inspector = None;
        self.context.with(|ctx| {
            self.functions.clear(&ctx);
            self.objects.release_all(&ctx);
        });
        self.drain_jobs();
        self.registry.clear();
    }
}

/// Scoped access to the engine while inside its context.
pub struct BridgeScope<'js> {
    ctx: Ctx<'js>,
    registry: ClassRegistry,
    objects: ObjectBridge,
    functions: Arc<FunctionTable>,
}

impl<'js> BridgeScope<'js> {
    #[inline]
    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    /// Find the canonical script object for a native address, creating it
    /// on first reference. Null maps to `undefined`.
    ///
    /// # Safety
    /// For classes registered with a payload size, `ptr` must be null or
    /// readable for at least that many bytes.
    pub fn find_or_add(&self, class_id: ClassId, ptr: *mut c_void) -> Result<Value<'js>> {
        self.objects.find_or_add(&self.ctx, &self.registry, class_id, ptr)
    }

    /// The callable script code invokes with `new`, tagged with `$cid`.
    /// `undefined` for unknown ids.
    pub fn class_constructor(&self, class_id: ClassId) -> Result<Value<'js>> {
        Ok(self.registry.class_constructor(&self.ctx, class_id)?)
    }

    /// Acquire a stable handle for a script function.
    pub fn acquire_function(&self, function: Function<'js>) -> Result<FunctionHandle> {
        self.functions.acquire(&self.ctx, function)
    }

    /// Restore the callable behind a handle.
    pub fn function(&self, handle: FunctionHandle) -> Result<Function<'js>> {
        self.functions.get(&self.ctx, handle)
    }

    /// Result of the most recent successful evaluation.
    pub fn last_result(&self) -> Result<Value<'js>> {
        Ok(bootstrap::helper(&self.ctx, "storedResult")?.call(())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{
        constructor_callback, destructor_callback, native_callback, CtorCall, NativeCall,
    };
    use rquickjs::IntoJs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> ScriptEngine {
        ScriptEngine::new(EngineOptions::default()).expect("engine construction")
    }

    /// Run enough collect/drain rounds for finalization registry callbacks
    /// to land.
    fn collect(engine: &mut ScriptEngine) {
        for _ in 0..3 {
            engine.low_memory_notification();
            engine.inspector_tick();
        }
    }

    fn f64_arg(call: &NativeCall<'_>, index: usize) -> f64 {
        call.arg(index)
            .cloned()
            .and_then(|v| f64::from_js(&call.ctx, v).ok())
            .unwrap_or(0.0)
    }

    #[test]
    fn platform_init_is_shared_between_engines() {
        let first = engine();
        let second = engine();
        first.eval("globalThis.x = 1", "a.js").unwrap();
        second.eval("globalThis.x = 2", "b.js").unwrap();
        let a = first.with(|s| i32::from_js(s.ctx(), s.ctx().globals().get("x").unwrap()).unwrap());
        let b = second.with(|s| i32::from_js(s.ctx(), s.ctx().globals().get("x").unwrap()).unwrap());
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn eval_reports_compile_errors_and_keeps_running() {
        let eng = engine();
        assert!(eng.eval("1+", "test.js").is_err());
        let text = eng.last_exception().expect("exception text");
        assert!(!text.is_empty());
        assert!(text.starts_with("test.js:"));
        assert!(eng.eval("1+1", "test.js").is_ok());
        let result = eng.with(|s| {
            let v = s.last_result().unwrap();
            i32::from_js(s.ctx(), v).unwrap()
        });
        assert_eq!(result, 2);
    }

    #[test]
    fn failed_eval_leaves_previous_result_untouched() {
        let eng = engine();
        eng.eval("40+2", "ok.js").unwrap();
        assert!(eng.eval("nope(", "bad.js").is_err());
        let kept = eng.with(|s| i32::from_js(s.ctx(), s.last_result().unwrap()).unwrap());
        assert_eq!(kept, 42);
    }

    #[test]
    fn runtime_exceptions_are_recorded() {
        let eng = engine();
        assert!(eng.eval("throw new Error('kaboom')", "boom.js").is_err());
        let text = eng.last_exception().unwrap();
        assert!(text.contains("kaboom"));
    }

    #[test]
    fn global_functions_are_callable_from_script() {
        let eng = engine();
        eng.set_global_function(
            "hostAdd",
            native_callback(|call: NativeCall<'_>| {
                let sum = f64_arg(&call, 0) + f64_arg(&call, 1);
                sum.into_js(&call.ctx)
            }),
            0,
        )
        .unwrap();
        eng.eval("globalThis.sum = hostAdd(2, 3)", "t.js").unwrap();
        let sum = eng.with(|s| f64::from_js(s.ctx(), s.ctx().globals().get("sum").unwrap()).unwrap());
        assert_eq!(sum, 5.0);
    }

    #[test]
    fn callbacks_can_raise_script_exceptions() {
        let eng = engine();
        eng.set_global_function(
            "needsOneArg",
            native_callback(|call: NativeCall<'_>| {
                if call.arg_count() != 1 {
                    return Err(call.throw("needsOneArg expects exactly one argument"));
                }
                call.undefined()
            }),
            0,
        )
        .unwrap();
        assert!(eng.eval("needsOneArg()", "t.js").is_err());
        let text = eng.last_exception().unwrap();
        assert!(text.contains("exactly one argument"));
        assert!(eng.eval("needsOneArg(1)", "t.js").is_ok());
    }

    #[test]
    fn bootstrap_eval_global_compiles_and_runs() {
        let eng = engine();
        eng.eval(
            "globalThis.answer = __tetherEvalScript('40+2', 'boot.js')",
            "t.js",
        )
        .unwrap();
        let answer =
            eng.with(|s| i32::from_js(s.ctx(), s.ctx().globals().get("answer").unwrap()).unwrap());
        assert_eq!(answer, 42);
        // Wrong arity is a script-visible failure, not a crash.
        assert!(eng.eval("__tetherEvalScript(1)", "t.js").is_err());
    }

    #[test]
    fn class_registration_is_idempotent_by_name() {
        let eng = engine();
        let first = eng.register_class("game.Widget", None, None, None, 0, 0).unwrap();
        let again = eng.register_class("game.Widget", None, None, None, 99, 64).unwrap();
        assert_eq!(first, again);
        let other = eng.register_class("game.Other", None, None, None, 0, 0).unwrap();
        assert_ne!(first, other);

        // Member registration on the original id still works after the
        // duplicate registration attempt.
        eng.register_function(
            first,
            "ping",
            true,
            native_callback(|call: NativeCall<'_>| "pong".into_js(&call.ctx)),
            0,
        )
        .unwrap();
        eng.with(|s| {
            let ctor = s.class_constructor(first).unwrap();
            s.ctx().globals().set("Widget", ctor).unwrap();
        });
        eng.eval("globalThis.r = Widget.ping()", "t.js").unwrap();
        let r = eng.with(|s| String::from_js(s.ctx(), s.ctx().globals().get("r").unwrap()).unwrap());
        assert_eq!(r, "pong");
    }

    #[test]
    fn unknown_class_ids_fail_softly() {
        let eng = engine();
        let err = eng
            .register_function(
                99,
                "nope",
                false,
                native_callback(|call: NativeCall<'_>| call.undefined()),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownClassId { class_id: 99 }));

        let base_err = eng
            .register_class("game.Sub", Some(7), None, None, 0, 0)
            .unwrap_err();
        assert!(matches!(base_err, BridgeError::UnknownClassId { class_id: 7 }));

        // Constructor lookup returns the undefined sentinel instead.
        let undefined = eng.with(|s| s.class_constructor(1234).unwrap().is_undefined());
        assert!(undefined);
    }

    #[test]
    fn find_or_add_preserves_identity() {
        let eng = engine();
        let id = eng.register_class("game.Widget", None, None, None, 0, 0).unwrap();
        let ptr = 0x4000usize as *mut c_void;
        eng.with(|s| {
            let a = s.find_or_add(id, ptr).unwrap();
            let b = s.find_or_add(id, ptr).unwrap();
            s.ctx().globals().set("a", a).unwrap();
            s.ctx().globals().set("b", b).unwrap();
            let same: bool = s.ctx().eval("a === b").unwrap();
            assert!(same);
        });
        assert_eq!(eng.bound_object_count(), 1);
        assert!(eng.has_bound_object(ptr));

        // Null is the undefined sentinel, never a binding.
        let undef = eng.with(|s| s.find_or_add(id, std::ptr::null_mut()).unwrap().is_undefined());
        assert!(undef);
        assert_eq!(eng.bound_object_count(), 1);
    }

    #[test]
    fn collected_objects_release_exactly_once() {
        let mut eng = engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = eng
            .register_class(
                "game.Widget",
                None,
                None,
                Some(destructor_callback(move |_addr, _data| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                0,
                0,
            )
            .unwrap();
        let ptr = 0x5000usize as *mut c_void;
        eng.with(|s| {
            let value = s.find_or_add(id, ptr).unwrap();
            s.ctx().globals().set("w", value).unwrap();
        });
        assert!(eng.has_bound_object(ptr));

        eng.eval("globalThis.w = undefined", "t.js").unwrap();
        collect(&mut eng);
        assert!(!eng.has_bound_object(ptr));
        assert_eq!(eng.bound_object_count(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Teardown must not release it a second time.
        drop(eng);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn script_new_runs_the_constructor_thunk() {
        let mut eng = engine();
        let freed = Arc::new(AtomicUsize::new(0));
        let freed_counter = freed.clone();
        let id = eng
            .register_class(
                "game.Counter",
                None,
                Some(constructor_callback(|call: CtorCall<'_>| {
                    let start = call
                        .args
                        .first()
                        .cloned()
                        .and_then(|v| i32::from_js(&call.ctx, v).ok())
                        .unwrap_or(0);
                    Box::into_raw(Box::new(start)) as *mut c_void
                })),
                Some(destructor_callback(move |addr, _data| {
                    // Safety: addresses for this class only ever come from
                    // the Box above.
                    unsafe { drop(Box::from_raw(addr as *mut i32)) };
                    freed_counter.fetch_add(1, Ordering::SeqCst);
                })),
                0,
                0,
            )
            .unwrap();
        eng.with(|s| {
            let ctor = s.class_constructor(id).unwrap();
            s.ctx().globals().set("Counter", ctor).unwrap();
        });
        eng.register_function(
            id,
            "value",
            false,
            native_callback(|call: NativeCall<'_>| {
                // Safety: `this` is the address produced by the constructor.
                let value = unsafe { *(call.this as *const i32) };
                value.into_js(&call.ctx)
            }),
            0,
        )
        .unwrap();

        eng.eval("globalThis.n = new Counter(7).value()", "t.js").unwrap();
        let n = eng.with(|s| i32::from_js(s.ctx(), s.ctx().globals().get("n").unwrap()).unwrap());
        assert_eq!(n, 7);

        // Calling without `new` is rejected at the boundary.
        assert!(eng.eval("Counter(1)", "t.js").is_err());

        collect(&mut eng);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
        assert_eq!(eng.bound_object_count(), 0);
    }

    #[test]
    fn payload_classes_copy_and_own_instance_bytes() {
        let eng = engine();
        // Two little-endian f32 components.
        let id = eng.register_class("math.Vec2", None, None, None, 0, 8).unwrap();
        eng.register_property(
            id,
            "length",
            false,
            native_callback(|call: NativeCall<'_>| {
                // Safety: bound payload is 8 bytes; unaligned reads because
                // payload buffers are plain byte buffers.
                let (x, y) = unsafe {
                    let base = call.this as *const f32;
                    (
                        std::ptr::read_unaligned(base),
                        std::ptr::read_unaligned(base.add(1)),
                    )
                };
                f64::from((x * x + y * y).sqrt()).into_js(&call.ctx)
            }),
            0,
            None,
            0,
            true,
        )
        .unwrap();
        eng.register_property(
            id,
            "x",
            false,
            native_callback(|call: NativeCall<'_>| {
                let x = unsafe { std::ptr::read_unaligned(call.this as *const f32) };
                f64::from(x).into_js(&call.ctx)
            }),
            0,
            Some(native_callback(|call: NativeCall<'_>| {
                let x = f64_arg(&call, 0) as f32;
                unsafe { std::ptr::write_unaligned(call.this as *mut f32, x) };
                call.undefined()
            })),
            0,
            false,
        )
        .unwrap();
        eng.with(|s| {
            let ctor = s.class_constructor(id).unwrap();
            s.ctx().globals().set("Vec2", ctor).unwrap();
        });

        // Script-constructed instances start zero-initialized.
        eng.eval("globalThis.v = new Vec2()", "t.js").unwrap();
        eng.eval("globalThis.l0 = v.length", "t.js").unwrap();
        // Writing through the registered setter is visible through the getter.
        eng.eval("v.x = 3; globalThis.l1 = v.length", "t.js").unwrap();
        // `length` has no setter: assignment is silently ignored.
        eng.eval("v.length = 99; globalThis.l2 = v.length", "t.js").unwrap();
        // ...and `dontDelete` keeps it around.
        eng.eval("delete v.length; globalThis.l3 = v.length", "t.js").unwrap();

        let (l0, l1, l2, l3) = eng.with(|s| {
            let g = s.ctx().globals();
            (
                f64::from_js(s.ctx(), g.get("l0").unwrap()).unwrap(),
                f64::from_js(s.ctx(), g.get("l1").unwrap()).unwrap(),
                f64::from_js(s.ctx(), g.get("l2").unwrap()).unwrap(),
                f64::from_js(s.ctx(), g.get("l3").unwrap()).unwrap(),
            )
        });
        assert_eq!(l0, 0.0);
        assert_eq!(l1, 3.0);
        assert_eq!(l2, 3.0);
        assert_eq!(l3, 3.0);

        // Host-initiated bridging copies the bytes: the host copy can be
        // mutated afterwards without the script side noticing.
        let mut host_vec = [3.0f32, 4.0f32];
        eng.with(|s| {
            let value = s
                .find_or_add(id, host_vec.as_mut_ptr() as *mut c_void)
                .unwrap();
            s.ctx().globals().set("hv", value).unwrap();
        });
        host_vec[0] = 100.0;
        eng.eval("globalThis.hl = hv.length", "t.js").unwrap();
        let hl = eng.with(|s| f64::from_js(s.ctx(), s.ctx().globals().get("hl").unwrap()).unwrap());
        assert_eq!(hl, 5.0);
    }

    #[test]
    fn subclasses_expose_ancestor_members() {
        let eng = engine();
        let shape = eng.register_class("game.Shape", None, None, None, 0, 0).unwrap();
        eng.register_function(
            shape,
            "kind",
            false,
            native_callback(|call: NativeCall<'_>| "shape".into_js(&call.ctx)),
            0,
        )
        .unwrap();
        eng.register_property(
            shape,
            "sides",
            false,
            native_callback(|call: NativeCall<'_>| 0i32.into_js(&call.ctx)),
            0,
            None,
            0,
            false,
        )
        .unwrap();
        let circle = eng
            .register_class("game.Circle", Some(shape), None, None, 0, 0)
            .unwrap();
        eng.register_function(
            circle,
            "radius",
            false,
            native_callback(|call: NativeCall<'_>| 1.5f64.into_js(&call.ctx)),
            0,
        )
        .unwrap();

        eng.with(|s| {
            let ctor = s.class_constructor(circle).unwrap();
            s.ctx().globals().set("Circle", ctor).unwrap();
        });
        eng.eval(
            "const c = new Circle();
             globalThis.kind = c.kind();
             globalThis.sides = c.sides;
             globalThis.radius = c.radius();
             globalThis.isCircle = c instanceof Circle;",
            "t.js",
        )
        .unwrap();
        eng.with(|s| {
            let g = s.ctx().globals();
            assert_eq!(String::from_js(s.ctx(), g.get("kind").unwrap()).unwrap(), "shape");
            assert_eq!(i32::from_js(s.ctx(), g.get("sides").unwrap()).unwrap(), 0);
            assert_eq!(f64::from_js(s.ctx(), g.get("radius").unwrap()).unwrap(), 1.5);
            assert!(bool::from_js(s.ctx(), g.get("isCircle").unwrap()).unwrap());
        });
    }

    #[test]
    fn statics_live_on_the_constructor() {
        let eng = engine();
        let id = eng.register_class("math.Vec2", None, None, None, 0, 8).unwrap();
        eng.register_function(
            id,
            "magic",
            true,
            native_callback(|call: NativeCall<'_>| 42i32.into_js(&call.ctx)),
            0,
        )
        .unwrap();
        eng.register_property(
            id,
            "tau",
            true,
            native_callback(|call: NativeCall<'_>| std::f64::consts::TAU.into_js(&call.ctx)),
            0,
            None,
            0,
            false,
        )
        .unwrap();
        eng.with(|s| {
            let ctor = s.class_constructor(id).unwrap();
            s.ctx().globals().set("Vec2", ctor).unwrap();
        });
        eng.eval(
            "globalThis.m = Vec2.magic(); globalThis.t = Vec2.tau; globalThis.cid = Vec2.$cid;",
            "t.js",
        )
        .unwrap();
        eng.with(|s| {
            let g = s.ctx().globals();
            assert_eq!(i32::from_js(s.ctx(), g.get("m").unwrap()).unwrap(), 42);
            assert_eq!(
                f64::from_js(s.ctx(), g.get("t").unwrap()).unwrap(),
                std::f64::consts::TAU
            );
            assert_eq!(u32::from_js(s.ctx(), g.get("cid").unwrap()).unwrap(), id);
        });
    }

    #[test]
    fn function_handles_cache_reuse_and_never_resurrect() {
        let eng = engine();
        eng.eval(
            "function one() { return 1; } function two() { return 2; }",
            "t.js",
        )
        .unwrap();
        eng.with(|s| {
            let one: Function = s.ctx().globals().get("one").unwrap();
            let two: Function = s.ctx().globals().get("two").unwrap();

            let first = s.acquire_function(one.clone()).unwrap();
            let again = s.acquire_function(one.clone()).unwrap();
            assert_eq!(first, again);

            let table = s.functions.clone();
            assert!(table.release(first));
            assert!(!table.release(first));
            assert!(s.function(first).is_err());

            // A different function may reuse the freed index...
            let second = s.acquire_function(two).unwrap();
            assert_eq!(second.index(), first.index());
            let result: i32 = s.function(second).unwrap().call(()).unwrap();
            assert_eq!(result, 2);

            // ...but re-acquiring the original must not resurrect the
            // released handle.
            let fresh = s.acquire_function(one).unwrap();
            assert_ne!(fresh.index(), second.index());
            let result: i32 = s.function(fresh).unwrap().call(()).unwrap();
            assert_eq!(result, 1);
        });
        assert_eq!(eng.function_table().live_count(), 2);
    }

    #[test]
    fn handles_release_from_other_threads() {
        let eng = engine();
        eng.eval("function cb() { return 3; }", "t.js").unwrap();
        let handle = eng.with(|s| {
            let cb: Function = s.ctx().globals().get("cb").unwrap();
            s.acquire_function(cb).unwrap()
        });
        let table = eng.function_table();
        let released = std::thread::spawn({
            let table = table.clone();
            move || table.release(handle)
        })
        .join()
        .unwrap();
        assert!(released);
        assert_eq!(table.live_count(), 0);

        // The released handle is dead, and its slot is reusable once the
        // engine thread re-enters the table.
        eng.with(|s| {
            assert!(s.function(handle).is_err());
            let cb: Function = s.ctx().globals().get("cb").unwrap();
            let fresh = s.acquire_function(cb).unwrap();
            assert_eq!(fresh.index(), handle.index());
            let result: i32 = s.function(fresh).unwrap().call(()).unwrap();
            assert_eq!(result, 3);
        });
    }

    #[test]
    fn teardown_releases_all_live_objects() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let eng = engine();
        let id = eng
            .register_class(
                "game.Widget",
                None,
                None,
                Some(destructor_callback(move |_addr, _data| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                0,
                0,
            )
            .unwrap();
        eng.with(|s| {
            for (slot, addr) in [("w0", 0x6000usize), ("w1", 0x6010), ("w2", 0x6020)] {
                let value = s.find_or_add(id, addr as *mut c_void).unwrap();
                s.ctx().globals().set(slot, value).unwrap();
            }
        });
        assert_eq!(eng.bound_object_count(), 3);
        drop(eng);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // Teardown with nothing live must also be clean.
        drop(engine());
    }

    #[test]
    fn general_destructor_backs_classes_without_one() {
        let mut eng = engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        eng.set_general_destructor(destructor_callback(move |_addr, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let id = eng.register_class("game.Plain", None, None, None, 0, 0).unwrap();
        eng.with(|s| {
            let value = s.find_or_add(id, 0x7000usize as *mut c_void).unwrap();
            s.ctx().globals().set("p", value).unwrap();
        });
        eng.eval("globalThis.p = undefined", "t.js").unwrap();
        collect(&mut eng);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn job_exceptions_reach_the_rejection_hook() {
        let mut eng = engine();
        eng.eval(
            "__tetherSetPromiseRejectCallback(function (err) {
                 globalThis.got = String(err);
             });
             Promise.resolve().then(function () { throw new Error('boom'); });",
            "t.js",
        )
        .unwrap();
        assert!(eng.inspector_tick());
        let got = eng.with(|s| String::from_js(s.ctx(), s.ctx().globals().get("got").unwrap()).unwrap());
        assert!(got.contains("boom"));
    }

    #[test]
    fn inspector_attach_is_idempotent() {
        let mut eng = engine();
        assert!(eng.inspector_tick());
        eng.create_inspector(0);
        eng.create_inspector(0);
        assert!(eng.inspector_tick());
        eng.destroy_inspector();
        assert!(eng.inspector_tick());
    }

    #[test]
    fn options_parse_from_json() {
        let options =
            EngineOptions::from_json(r#"{ "memory_limit": 1048576, "gc_threshold": 65536 }"#)
                .unwrap();
        assert_eq!(options.memory_limit, Some(1_048_576));
        assert_eq!(options.gc_threshold, Some(65_536));
        assert_eq!(options.max_stack_size, None);

        let eng = ScriptEngine::new(EngineOptions {
            memory_limit: Some(32 * 1024 * 1024),
            gc_threshold: Some(256 * 1024),
            max_stack_size: Some(512 * 1024),
        })
        .unwrap();
        eng.eval("1+1", "t.js").unwrap();
    }
}
