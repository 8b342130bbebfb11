//! HTTP middleware for the authentication gate.
//!
//! The gate guards every route that is not part of the auth surface:
//!
//! ```text
//! Request → Access Gate → Proxy Dispatcher
//!              ↓
//!   303 /auth/setup  (nothing enrolled yet)
//!   303 /auth/login  (no authenticated session; original path recorded)
//! ```
//!
//! WebSocket upgrade handshakes pass through untouched - they are
//! authenticated inside the proxy dispatcher against the raw `Cookie`
//! header, where rejection means failing the handshake instead of
//! redirecting.

pub mod gate;

pub use gate::AccessGate;
