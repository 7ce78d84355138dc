pub mod config;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod pool;
pub mod queue;
pub mod recovery_log;
pub mod worker_io;

pub use error::{Error, Result};
pub use event::Event;
