//! Class registry: fully-qualified names to dense class ids, one prototype
//! and constructor pair per id, single-inheritance chaining.
//!
//! Prototype and constructor objects live in the script heap (stored in the
//! support table, keyed by class id); the host side keeps only the thunks
//! and layout metadata needed to bind instances.

use crate::bootstrap;
use crate::callback::{
    self, CallbackRecord, ConstructorCallback, DestructorCallback, NativeCallback,
};
use crate::engine::EngineShared;
use crate::error::{BridgeError, Result};
use crate::object::{self, ObjectBridge};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::{Array, Ctx, Function, IntoJs, Object, Undefined, Value};

/// Dense class id, assigned at registration, indexing the record table from 0.
pub type ClassId = u32;

/// Per-class registration record. Never mutated after creation; members and
/// properties accumulate on the script-side prototype, not here.
pub(crate) struct ClassRecord {
    pub name: String,
    pub base: Option<ClassId>,
    pub constructor: Option<ConstructorCallback>,
    pub destructor: Option<DestructorCallback>,
    pub data: i64,
    /// Instance payload size in bytes; zero means the binding stores a raw
    /// host address instead of an owned copy.
    pub payload_size: usize,
}

/// Thunk and layout data needed to bind one instance.
#[derive(Clone)]
pub(crate) struct RecordView {
    pub class_id: ClassId,
    pub constructor: Option<ConstructorCallback>,
    pub destructor: Option<DestructorCallback>,
    pub data: i64,
    pub payload_size: usize,
}

#[derive(Default)]
struct RegistryInner {
    classes: Vec<ClassRecord>,
    by_name: HashMap<String, ClassId>,
    /// Keeps every registered callback alive for the engine lifetime; the
    /// script-side function objects capture clones of these records.
    callbacks: Vec<Arc<CallbackRecord>>,
}

#[derive(Clone)]
pub(crate) struct ClassRegistry {
    inner: Rc<RefCell<RegistryInner>>,
    shared: Rc<EngineShared>,
}

impl ClassRegistry {
    pub fn new(shared: Rc<EngineShared>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner::default())),
            shared,
        }
    }

    /// Register a class. Idempotent on `name`: a repeat registration returns
    /// the previously assigned id and ignores the new thunks.
    #[allow(clippy::too_many_arguments)]
    pub fn register_class<'js>(
        &self,
        ctx: &Ctx<'js>,
        objects: &ObjectBridge,
        name: &str,
        base: Option<ClassId>,
        constructor: Option<ConstructorCallback>,
        destructor: Option<DestructorCallback>,
        data: i64,
        payload_size: usize,
    ) -> Result<ClassId> {
        if let Some(&id) = self.inner.borrow().by_name.get(name) {
            return Ok(id);
        }
        if let Some(base_id) = base {
            if base_id as usize >= self.inner.borrow().classes.len() {
                return Err(BridgeError::UnknownClassId { class_id: base_id });
            }
        }

        let class_id = self.inner.borrow().classes.len() as ClassId;
        self.inner.borrow_mut().classes.push(ClassRecord {
            name: name.to_string(),
            base,
            constructor,
            destructor,
            data,
            payload_size,
        });
        self.inner
            .borrow_mut()
            .by_name
            .insert(name.to_string(), class_id);

        let prototype = Object::new(ctx.clone())?;
        if let Some(base_id) = base {
            let base_proto: Value = bootstrap::helper(ctx, "protoOf")?.call((base_id,))?;
            bootstrap::helper(ctx, "setProto")?
                .call::<_, ()>((prototype.clone(), base_proto))?;
        }

        let registry = self.clone();
        let bridge = objects.clone();
        let shared = self.shared.clone();
        let create = Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Array<'js>| {
            if shared.is_disposing() {
                let err = bootstrap::boundary_error(&ctx, "engine is shutting down")?;
                return Err(ctx.throw(err));
            }
            object::construct_from_script(&bridge, &registry, ctx, class_id, args)
        })?;

        let ctor: Value =
            bootstrap::helper(ctx, "makeCtor")?.call((name, create, prototype.clone()))?;
        bootstrap::helper(ctx, "storeClass")?.call::<_, ()>((class_id, ctor, prototype))?;

        tracing::debug!(class = name, class_id, base = ?base, payload_size, "registered class");
        Ok(class_id)
    }

    /// Add a member or static callable to a registered class.
    pub fn register_function<'js>(
        &self,
        ctx: &Ctx<'js>,
        class_id: ClassId,
        name: &str,
        is_static: bool,
        callback: NativeCallback,
        data: i64,
    ) -> Result<()> {
        self.ensure_known(class_id)?;
        let raw = self.trampoline(ctx, is_static, callback, data)?;
        let wrapper = if is_static { "staticFn" } else { "method" };
        let wrapped: Value = bootstrap::helper(ctx, wrapper)?.call((raw,))?;
        let target = self.member_target(ctx, class_id, is_static)?;
        bootstrap::helper(ctx, "defineValue")?.call::<_, ()>((target, name, wrapped))?;
        tracing::debug!(class_id, member = name, is_static, "registered function");
        Ok(())
    }

    /// Add an accessor property. Without a setter the property is read-only:
    /// assignments are silently ignored. `dont_delete` makes it
    /// non-configurable from script code.
    #[allow(clippy::too_many_arguments)]
    pub fn register_property<'js>(
        &self,
        ctx: &Ctx<'js>,
        class_id: ClassId,
        name: &str,
        is_static: bool,
        getter: NativeCallback,
        getter_data: i64,
        setter: Option<NativeCallback>,
        setter_data: i64,
        dont_delete: bool,
    ) -> Result<()> {
        self.ensure_known(class_id)?;
        let raw_getter = self.trampoline(ctx, is_static, getter, getter_data)?;
        let wrapped_getter: Value = bootstrap::helper(ctx, "getter")?.call((raw_getter,))?;
        let wrapped_setter: Value = match setter {
            Some(setter) => {
                let raw = self.trampoline(ctx, is_static, setter, setter_data)?;
                bootstrap::helper(ctx, "setter")?.call((raw,))?
            }
            None => Undefined.into_js(ctx)?,
        };
        let target = self.member_target(ctx, class_id, is_static)?;
        bootstrap::helper(ctx, "defineAccessor")?
            .call::<_, ()>((target, name, wrapped_getter, wrapped_setter, dont_delete))?;
        tracing::debug!(class_id, property = name, is_static, dont_delete, "registered property");
        Ok(())
    }

    /// Install a process-global callable with no owning instance.
    pub fn set_global_function<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        callback: NativeCallback,
        data: i64,
    ) -> Result<()> {
        let raw = self.trampoline(ctx, true, callback, data)?;
        let wrapped: Value = bootstrap::helper(ctx, "staticFn")?.call((raw,))?;
        ctx.globals().set(name, wrapped)?;
        tracing::debug!(global = name, "registered global function");
        Ok(())
    }

    /// The callable a script invokes with `new`, tagged with its class id.
    /// Unknown ids yield `undefined` rather than an error; callers are
    /// expected to check.
    pub fn class_constructor<'js>(
        &self,
        ctx: &Ctx<'js>,
        class_id: ClassId,
    ) -> rquickjs::Result<Value<'js>> {
        let ctor: Value = bootstrap::helper(ctx, "ctorOf")?.call((class_id,))?;
        if !ctor.is_undefined() {
            bootstrap::helper(ctx, "defineValue")?
                .call::<_, ()>((ctor.clone(), "$cid", class_id))?;
        }
        Ok(ctor)
    }

    pub fn record_view(&self, class_id: ClassId) -> Option<RecordView> {
        let inner = self.inner.borrow();
        inner.classes.get(class_id as usize).map(|record| RecordView {
            class_id,
            constructor: record.constructor.clone(),
            destructor: record.destructor.clone(),
            data: record.data,
            payload_size: record.payload_size,
        })
    }

    /// Drop every class record and callback record. Only valid during
    /// engine teardown, after the last script call has returned.
    pub fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        let classes = inner.classes.len();
        let callbacks = inner.callbacks.len();
        inner.classes.clear();
        inner.by_name.clear();
        inner.callbacks.clear();
        tracing::debug!(classes, callbacks, "cleared class registry");
    }

    fn ensure_known(&self, class_id: ClassId) -> Result<()> {
        if (class_id as usize) < self.inner.borrow().classes.len() {
            Ok(())
        } else {
            Err(BridgeError::UnknownClassId { class_id })
        }
    }

    /// Build the script-side adapter for one callback record: a plain
    /// function receiving the packed `(receiver, arguments)` pair our
    /// wrappers always pass, delegating to the generic dispatch.
    fn trampoline<'js>(
        &self,
        ctx: &Ctx<'js>,
        is_static: bool,
        callback: NativeCallback,
        data: i64,
    ) -> rquickjs::Result<Function<'js>> {
        let record = CallbackRecord::new(is_static, callback, data);
        self.inner.borrow_mut().callbacks.push(record.clone());
        let shared = self.shared.clone();
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, this: Value<'js>, args: Array<'js>| {
            if shared.is_disposing() {
                let err = bootstrap::boundary_error(&ctx, "engine is shutting down")?;
                return Err(ctx.throw(err));
            }
            callback::dispatch(ctx, &record, this, args)
        })
    }

    fn member_target<'js>(
        &self,
        ctx: &Ctx<'js>,
        class_id: ClassId,
        is_static: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let which = if is_static { "ctorOf" } else { "protoOf" };
        bootstrap::helper(ctx, which)?.call((class_id,))
    }
}
