//! Master and slave controllers and the tick loops that drive them

pub mod master;
pub mod registry;
pub mod runtime;
pub mod slave;
pub mod stats;

pub use master::{MasterNode, MasterSettings};
pub use registry::{health_rating, SlaveRegistry};
pub use runtime::{MasterRuntime, SlaveRuntime, TickPacer};
pub use slave::{SlaveNode, SlaveSettings};
pub use stats::{HealthSnapshot, HealthSource, ProcessStats};
