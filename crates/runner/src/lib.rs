pub mod app;
pub mod bus;
pub mod worker;

pub use app::{App, WorkerReport, lock_service};
pub use bus::{BusError, BusMessage, BusResult, MemSubscription, MemTopic, MessageBus};
pub use worker::{MessageOutcome, Worker, WorkerStats};
