//! Tether Runtime
//!
//! Minimal host binary: boots a script engine, exposes a demo native class
//! and drives the cooperative tick loop.

use anyhow::Result;
use std::ffi::c_void;
use rquickjs::{FromJs, IntoJs};
use tether_bridge::{native_callback, EngineOptions, NativeCall, ScriptEngine};

fn f64_arg(call: &NativeCall<'_>, index: usize) -> f64 {
    call.arg(index)
        .cloned()
        .and_then(|v| f64::from_js(&call.ctx, v).ok())
        .unwrap_or(0.0)
}

fn register_vec2(engine: &ScriptEngine) -> Result<tether_bridge::ClassId> {
    // Two f32 components, copied into an engine-owned payload.
    let vec2 = engine.register_class("tether.Vec2", None, None, None, 0, 8)?;
    engine.register_property(
        vec2,
        "length",
        false,
        native_callback(|call: NativeCall<'_>| {
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
    )?;
    engine.register_property(
        vec2,
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
    )?;
    engine.register_property(
        vec2,
        "y",
        false,
        native_callback(|call: NativeCall<'_>| {
            let y = unsafe { std::ptr::read_unaligned((call.this as *const f32).add(1)) };
            f64::from(y).into_js(&call.ctx)
        }),
        0,
        Some(native_callback(|call: NativeCall<'_>| {
            let y = f64_arg(&call, 0) as f32;
            unsafe { std::ptr::write_unaligned((call.this as *mut f32).add(1), y) };
            call.undefined()
        })),
        0,
        false,
    )?;
    engine.with(|scope| -> Result<()> {
        let ctor = scope.class_constructor(vec2)?;
        scope.ctx().globals().set("Vec2", ctor)?;
        Ok(())
    })?;
    Ok(vec2)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    tracing::info!("Tether Runtime v{}", tether_bridge::VERSION);

    let mut engine = ScriptEngine::new(EngineOptions::default())?;
    engine.set_global_function(
        "print",
        native_callback(|call: NativeCall<'_>| {
            let mut parts = Vec::with_capacity(call.arg_count());
            for value in &call.args {
                parts.push(
                    String::from_js(&call.ctx, value.clone())
                        .unwrap_or_else(|_| "<value>".to_string()),
                );
            }
            println!("[script] {}", parts.join(" "));
            call.undefined()
        }),
        0,
    )?;
    let vec2 = register_vec2(&engine)?;

    // Bridge a host-side vector into script code, then let the script build
    // its own.
    let mut host_vec = [3.0f32, 4.0f32];
    engine.with(|scope| -> Result<()> {
        let bridged = scope.find_or_add(vec2, host_vec.as_mut_ptr() as *mut c_void)?;
        scope.ctx().globals().set("hostVec", bridged)?;
        Ok(())
    })?;

    let demo = r#"
        print("host vector length: " + hostVec.length);
        const v = new Vec2();
        v.x = 6;
        v.y = 8;
        print("script vector length: " + v.length);
        Promise.resolve().then(function () {
            print("async work drained by the tick loop");
        });
    "#;
    if let Err(err) = engine.eval(demo, "demo.js") {
        tracing::error!(%err, "demo script failed");
        if let Some(text) = engine.last_exception() {
            tracing::error!(exception = text.as_str(), "last exception");
        }
        return Err(err.into());
    }

    engine.create_inspector(9229);
    for _ in 0..3 {
        if !engine.inspector_tick() {
            break;
        }
    }
    engine.destroy_inspector();

    tracing::info!(
        bound_objects = engine.bound_object_count(),
        "runtime shutting down"
    );
    Ok(())
}
