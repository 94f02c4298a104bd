mod config;
mod consts;
mod eviction_loop;
mod failures;
mod gateway;
mod labels;
mod metrics;
mod park;
mod planner;
mod rollout;
mod schedule;
mod shutdown;
mod sources;
mod spawn_service;
mod unpark;
mod workload;

pub use crate::config::Config;
pub use crate::eviction_loop::{run_tick, start_eviction_loop};
pub use crate::gateway::ClusterGateway;
pub use crate::metrics::Metrics;
pub use crate::schedule::ScheduleGate;
pub use crate::shutdown::Shutdown;
