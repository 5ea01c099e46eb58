//! Debug attachment.
//!
//! Only the attach/detach/tick contract lives here; the inspector wire
//! protocol is a separate concern. The session binds a non-blocking local
//! listener so external tooling can connect, and reports through `tick`
//! whether the host loop should keep running.

use std::io;
use std::net::{TcpListener, TcpStream};

/// A lazily created debug session bound to the engine's execution context.
pub struct DebugSession {
    port: u16,
    listener: Option<TcpListener>,
}

impl DebugSession {
    /// Bind a session on `port`. A failed bind still yields a session (the
    /// attach contract is idempotent and non-fatal); it simply never accepts.
    pub fn bind(port: u16) -> Self {
        let listener = match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => match listener.set_nonblocking(true) {
                Ok(()) => {
                    tracing::info!(port, "debug session listening");
                    Some(listener)
                }
                Err(err) => {
                    tracing::warn!(port, %err, "debug session listener unusable");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(port, %err, "debug session failed to bind");
                None
            }
        };
        Self { port, listener }
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// One cooperative tick: poll for new connections without blocking.
    /// Returns the continuation signal for the host loop (true = keep
    /// running).
    pub fn tick(&mut self) -> bool {
        if let Some(listener) = &self.listener {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "debugger connected");
                        self.greet(stream);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        tracing::warn!(%err, "debug session accept failed");
                        break;
                    }
                }
            }
        }
        true
    }

    // Wire protocol is out of scope; connections are acknowledged and closed.
    fn greet(&self, stream: TcpStream) {
        drop(stream);
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        tracing::info!(port = self.port, "debug session detached");
    }
}
