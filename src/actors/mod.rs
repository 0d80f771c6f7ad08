//! Actor-based collaborators of the hub
//!
//! Each actor runs as an independent tokio task and is controlled through a
//! cloneable handle that talks to it over channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!   Collector-1 … Collector-N          RuleManager
//!   (TargetManager)                    (recording rules)   (alerting rules)
//!         │                                   │                   │
//!         └──────────── SampleSender ─────────┘                   │ try_send
//!                          │                                      ▼
//!                  Bounded Sample Queue                   Notification queue
//!                          │                                      │
//!                       FanOut                            NotificationHandler
//!                    │          │                                 │
//!               Storage   RemoteQueueManager                Alertmanager
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for queries (health, alerts)
//! 3. **Shutdown**: every handle implements `Subsystem` and returns once its
//!    actor has exited

pub mod collector;
pub mod messages;
pub mod notifier;
pub mod remote;
pub mod rules;
pub mod targets;

pub use collector::CollectorHandle;
pub use messages::{ActiveAlert, AlertState, Health, Notification, TargetHealth};
pub use notifier::NotifierHandle;
pub use remote::{RemoteQueueManager, RemoteStats};
pub use rules::{RuleContext, RuleManagerHandle};
pub use targets::TargetManagerHandle;
