//! Script-side support table installed into every fresh context.
//!
//! All engine-internal script state (class prototypes and constructors, the
//! address-to-object weak map, the finalization registry, cached function
//! slots) lives in one table created by a bootstrap expression and stored on
//! the global object. Keeping that state inside the script heap means it is
//! torn down together with the context; the host side never holds a direct
//! reference into the heap.

use rquickjs::{Ctx, Function, Object, Value};

/// Global property the support table is stored under.
pub const SUPPORT_TABLE_KEY: &str = "__tether";

/// Bootstrap source. Evaluates to a factory taking the host finalization
/// callback and returning the support table. Uses `WeakRef` +
/// `FinalizationRegistry` as the weak-handle-with-callback primitive: the
/// address-to-object association must keep neither side alive.
const SUPPORT_TABLE_SRC: &str = r#"
(function (onFinalize) {
    const boundKey = Symbol("tether.bound");
    const slotKey = Symbol("tether.slot");
    const genKey = Symbol("tether.gen");
    const registry = new FinalizationRegistry(onFinalize);
    const objects = new Map();
    const classes = [];
    const fns = [];
    let lastResult;
    let onRejected;
    return {
        tag: function (obj, addr) {
            obj[boundKey] = addr;
            registry.register(obj, addr);
            objects.set(addr, new WeakRef(obj));
        },
        boundAddr: function (value) {
            if (value !== null && typeof value === "object" && typeof value[boundKey] === "number") {
                return value[boundKey];
            }
            return -1;
        },
        find: function (addr) {
            const ref = objects.get(addr);
            if (ref === undefined) return null;
            const obj = ref.deref();
            if (obj === undefined) {
                objects.delete(addr);
                return null;
            }
            return obj;
        },
        forget: function (addr) { objects.delete(addr); },
        clearObjects: function () { objects.clear(); },
        storeClass: function (id, ctor, proto) { classes[id] = { ctor: ctor, proto: proto }; },
        ctorOf: function (id) { const c = classes[id]; return c === undefined ? undefined : c.ctor; },
        protoOf: function (id) { const c = classes[id]; return c === undefined ? undefined : c.proto; },
        makeCtor: function (name, create, proto) {
            const ctor = function (...args) {
                if (new.target === undefined) {
                    throw new TypeError(name + " is a native class and must be called with new");
                }
                return create(args);
            };
            ctor.prototype = proto;
            Object.defineProperty(proto, "constructor", { value: ctor, writable: true, configurable: true });
            Object.defineProperty(ctor, "name", { value: name, configurable: true });
            return ctor;
        },
        setProto: function (target, proto) { Object.setPrototypeOf(target, proto); },
        defineValue: function (target, name, value) {
            Object.defineProperty(target, name, { value: value, writable: true, enumerable: false, configurable: true });
        },
        defineAccessor: function (target, name, getter, setter, dontDelete) {
            const desc = { get: getter, enumerable: true, configurable: !dontDelete };
            if (setter !== undefined && setter !== null) desc.set = setter;
            Object.defineProperty(target, name, desc);
        },
        method: function (fn) { return function (...args) { return fn(this, args); }; },
        getter: function (fn) { return function () { return fn(this, []); }; },
        setter: function (fn) { return function (value) { return fn(this, [value]); }; },
        staticFn: function (fn) { return function (...args) { return fn(undefined, args); }; },
        makeError: function (message) { return new TypeError(message); },
        describe: function (err) {
            try {
                if (err instanceof Error && typeof err.stack === "string") {
                    return err.message + "\n" + err.stack;
                }
                return String(err);
            } catch (_) {
                return "<unprintable exception>";
            }
        },
        storeFn: function (idx, fn) { fns[idx] = fn; },
        fnAt: function (idx) { return fns[idx]; },
        dropFn: function (idx) { fns[idx] = undefined; },
        clearFns: function () { fns.length = 0; },
        cacheSlot: function (fn, idx, gen) { fn[slotKey] = idx; fn[genKey] = gen; },
        cachedSlot: function (fn) {
            const idx = typeof fn[slotKey] === "number" ? fn[slotKey] : -1;
            const gen = typeof fn[genKey] === "number" ? fn[genKey] : -1;
            return [idx, gen];
        },
        storeResult: function (value) { lastResult = value; },
        storedResult: function () { return lastResult; },
        setOnRejected: function (fn) { onRejected = fn; },
        rejectedHook: function () { return onRejected; },
    };
})
"#;

/// Evaluate the bootstrap expression and install the support table on the
/// global object. `on_finalize` is invoked by the engine's finalization
/// registry with the bound address of a collected object.
pub fn install<'js>(ctx: &Ctx<'js>, on_finalize: Function<'js>) -> rquickjs::Result<()> {
    let factory: Function = ctx.eval(SUPPORT_TABLE_SRC)?;
    let table: Object = factory.call((on_finalize,))?;
    ctx.globals().set(SUPPORT_TABLE_KEY, table)?;
    Ok(())
}

/// Fetch one helper function from the installed support table.
pub fn helper<'js>(ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Function<'js>> {
    let table: Object = ctx.globals().get(SUPPORT_TABLE_KEY)?;
    table.get(name)
}

/// Build a script-visible `TypeError` for boundary failures.
pub fn boundary_error<'js>(ctx: &Ctx<'js>, message: &str) -> rquickjs::Result<Value<'js>> {
    helper(ctx, "makeError")?.call((message,))
}

/// Render an exception value the way evaluation failures are reported.
pub fn describe_exception<'js>(ctx: &Ctx<'js>, exception: Value<'js>) -> String {
    let rendered: rquickjs::Result<String> = (|| helper(ctx, "describe")?.call((exception,)))();
    rendered.unwrap_or_else(|_| "<unprintable exception>".to_string())
}
