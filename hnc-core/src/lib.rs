//! HNC Core - Hierarchical Namespace Reconciliation
//!
//! Maintains a forest of namespaces and continuously reconciles it toward
//! a consistent state:
//!
//! - **Hierarchy**: acyclic parent links, roots, orphans
//! - **Propagation**: policy objects copied top-down into descendants
//! - **Anchors**: subnamespaces declared by their parent
//! - **Cascading deletion**: bounded to anchored subnamespaces
//! - **Conditions**: diagnostics recomputed on every pass
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Controller                           │
//! │   store events ──► WorkQueue ──► workers (lock per root)     │
//! │                                      │                       │
//! │                              ┌───────▼───────┐               │
//! │                              │  Reconciler   │               │
//! │                              └───────┬───────┘               │
//! │  ┌──────────┐  ┌─────────┐  ┌────────▼────┐  ┌────────────┐  │
//! │  │ Anchors  │──│ Cascade │──│ Propagation │──│ Conditions │  │
//! │  └──────────┘  └─────────┘  └─────────────┘  └────────────┘  │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//!                         ┌──────▼──────┐
//!                         │ ObjectStore │
//!                         └─────────────┘
//! ```

pub mod anchor;
pub mod cascade;
pub mod commands;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod hierarchy;
pub mod propagation;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod views;

// Re-export main types
pub use anchor::AnchorReconciler;
pub use cascade::CascadeDeletePlanner;
pub use commands::HierarchyCommands;
pub use conditions::ConditionManager;
pub use config::HncConfig;
pub use controller::{Controller, ControllerHandle};
pub use hierarchy::HierarchyStore;
pub use propagation::PropagationEngine;
pub use reconciler::Reconciler;
pub use store::{MemoryStore, ObjectStore};
pub use types::*;
