//! Alert routing for Clawbernetes.
//!
//! `claw-routing` decides which receivers get which alerts, grouped how, and
//! when. A [`RoutingTree`] resource describes a hierarchy of routes; the
//! engine compiles it into an immutable snapshot, walks it for every incoming
//! alert, buckets the alert into per-route groups and schedules grouped
//! notifications with `group_wait`, `group_interval` and `repeat_interval`
//! timing, honoring mute time intervals.
//!
//! # Features
//!
//! - **Matchers**: `=`, `!=`, `=~`, `!~` with a shared regex cache
//! - **Continue semantics**: fan an alert out to several receivers
//! - **Inheritance**: receiver, grouping and timings flow from parent to child
//! - **Mute time intervals**: weekday, time-of-day, day-of-month, month and year ranges
//! - **Hot reload**: invalid trees are rejected and the last good one stays in force
//! - **Sharded grouping**: each group is owned by a single task, timers on one wheel
//!
//! # Example
//!
//! ```rust
//! use claw_routing::{
//!     walker, CompiledTree, Matcher, MuteResolver, RegexCache, Route, RouteDefaults,
//!     RoutingTree, Alert,
//! };
//! use chrono::Utc;
//!
//! let tree = RoutingTree::new(
//!     "main",
//!     RouteDefaults::new("ops"),
//!     vec![Route::new().matcher(Matcher::eq("team", "db")).receiver("dba")],
//! );
//! let compiled = CompiledTree::compile(&tree, &MuteResolver::empty(), &RegexCache::new()).unwrap();
//!
//! let db = Alert::from_pairs([("alertname", "DiskFull"), ("team", "db")]);
//! let routes = walker::route(&db, &compiled, Utc::now());
//! assert_eq!(routes[0].receiver(), "dba");
//!
//! let web = Alert::from_pairs([("alertname", "Slow"), ("team", "web")]);
//! assert_eq!(walker::route(&web, &compiled, Utc::now())[0].receiver(), "ops");
//! ```
//!
//! # Running the engine
//!
//! ```rust,ignore
//! use claw_routing::{EngineConfig, LogSink, RoutingEngine};
//! use std::sync::Arc;
//!
//! let engine = RoutingEngine::start(EngineConfig::default(), &tree, Arc::new(LogSink))?;
//! engine.ingest(alert).await?;
//! // ...
//! engine.shutdown(true).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod group;
pub mod matcher;
pub mod mute;
pub mod scheduler;
pub mod schema;
mod shard;
pub mod store;
mod timer;
pub mod tree;
pub mod types;
pub mod walker;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, RetryConfig};
pub use dispatch::{DeliveryReport, DispatchError, DispatchSink, LogSink, Notification, RecordingSink};
pub use engine::RoutingEngine;
pub use error::{Result, RoutingError};
pub use group::{GroupId, GroupKey, GroupSummary, NotifiedAlert};
pub use matcher::{CompiledMatcher, RegexCache};
pub use mute::{
    MuteResolver, StaticIntervalRegistry, TimeInterval, TimeIntervalRegistry, TimeIntervalSpec,
    TimeOfDaySpec, TimeRangeSpec,
};
pub use scheduler::{FlushReason, GroupPhase};
pub use schema::{
    ListMeta, MatchType, Matcher, ObjectMeta, OperatorState, OperatorStateKind, Route,
    RouteDefaults, RoutingTree, RoutingTreeList, RoutingTreeSpec, RoutingTreeStatus,
};
pub use store::{MemoryTreeSource, SnapshotStore, TreeEvent, TreeSnapshot, TreeSource};
pub use tree::{CompiledTree, EffectiveConfig, GroupBy, NodeId, RouteKey, RouteNode};
pub use types::{Alert, AlertStatus, Fingerprint, LabelSet};
pub use walker::{Evaluation, MatchedRoute};
