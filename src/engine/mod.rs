//! Lease coordination engine: coordinator ticks, backlog drains, item
//! production and the scheduler that drives them.

pub mod coordinator;
pub mod dispatch;
pub mod producer;
pub mod schedule;

pub use coordinator::{
    Coordinator, CoordinatorConfig, FixedSelector, PartitionSelector, Phase, RandomSelector,
    RoundRobin, TickOutcome,
};
pub use dispatch::{Dispatcher, DrainReport, ItemOutcome, SimulatedWork, WorkHandler};
pub use producer::{ModTimeSource, Producer, ProducerConfig};
pub use schedule::Scheduler;
