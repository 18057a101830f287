//! Push execution engine.
//!
//! Rows ingested from broker sources flow through per-view operator DAGs
//! (projection, selection, scan, union-all, incremental aggregation) and
//! land in materialized-view tables. Work is serialized per shard by a
//! cooperative scheduler; rows cross shards through the forwarder/receiver
//! queues with per-sender de-duplication; new views bootstrap from a
//! snapshot of their feeding table while live rows are captured and
//! replayed (the fill protocol).

pub mod engine;
pub mod exec;
pub mod forward;
pub mod meta;
pub mod plan;
pub mod sched;
pub mod source;

pub use engine::{EngineConfig, PushEngine};
pub use exec::{ExecutionContext, PushExecutor};
pub use forward::Forwarder;
pub use meta::{SourceInfo, TableInfo};
pub use plan::{AggExpr, AggFunction, BinOp, Expr, PhysicalPlan};
pub use sched::ShardScheduler;
pub use source::broker::{FakeBroker, Message, MessageProvider};
