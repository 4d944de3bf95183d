// Retention classification, sweep and deletion logic.

pub mod executor;
pub mod policy;
pub mod scheduler;
pub mod sweep;

pub use executor::*;
pub use policy::*;
pub use scheduler::*;
pub use sweep::*;
