//! Worker threads for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - Lazily grown pool of reusable threads
//! - [`Worker`] - Handle to one pooled thread
//! - [`Completion`] - Outcome of running one task under a deadline
//!
//! # Lifecycle
//!
//! ```text
//!   acquire_worker()                run_with_deadline()
//!  ┌──────────────┐   idle / new   ┌───────────────────┐  in time   ┌──────────┐
//!  │ idle workers │ ─────────────▶ │  busy (1 task)    │ ─────────▶ │ released │──┐
//!  └──────────────┘                └───────────────────┘            └──────────┘  │
//!         ▲                                  │ deadline expired                   │
//!         │                                  ▼                                    │
//!         │                        ┌───────────────────┐                          │
//!         │                        │ abandoned (never  │                          │
//!         │                        │ reused, detached) │                          │
//!         │                        └───────────────────┘                          │
//!         └───────────────────────────────────────────────────────────────────────┘
//! ```

mod pool;

pub use pool::{Completion, Worker, WorkerPool, WorkerPoolError, WorkerPoolStats};
