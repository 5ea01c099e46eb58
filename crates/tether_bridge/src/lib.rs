//! Tether Bridge
//!
//! Cross-runtime object bridging between a native host and an embedded
//! QuickJS context:
//! - Class registry with dense ids and single inheritance
//! - Identity-preserving object bridge with weak, GC-driven release
//! - Generic callback dispatch for host thunks
//! - Stable handles for script functions the host calls back later
//! - Engine lifecycle with orderly teardown and a cooperative tick

mod bootstrap;
pub mod callback;
pub mod engine;
pub mod error;
pub mod handle;
pub mod inspector;
mod object;
pub mod registry;

pub use callback::{
    constructor_callback, destructor_callback, native_callback, CallbackRecord,
    ConstructorCallback, CtorCall, DestructorCallback, NativeCall, NativeCallback,
};
pub use engine::{ensure_platform_init, BridgeScope, EngineOptions, ScriptEngine};
pub use error::{BridgeError, Result};
pub use handle::{FunctionHandle, FunctionTable};
pub use inspector::DebugSession;
pub use registry::ClassId;

pub use rquickjs;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
