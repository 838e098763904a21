//! Pipeline stages for receipt extraction.
//!
//! Each submodule implements one step; the orchestrator in
//! [`crate::extract`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! image ──▶ image ──▶ client ──▶ span ──▶ schema
//! (path)   (resize)   (VLM)     (find)   (validate)
//!                       │
//!                       └──▶ stats (latency / cost, best effort)
//! ```
//!
//! 1. [`image`]  — validate, downscale and re-encode; CPU work in `spawn_blocking`
//! 2. [`client`] — one chat completion per stage; the only stage with network I/O
//!    besides [`stats`]
//! 3. [`stats`]  — eventually-consistent generation stats with jittered backoff
//! 4. [`span`]   — isolate the JSON document inside free-form model text
//! 5. [`schema`] — decode into typed receipt records and reconcile totals

pub mod client;
pub mod image;
pub mod schema;
pub mod span;
pub mod stats;
