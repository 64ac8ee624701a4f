//! Runtime plumbing shared by the manager's background tasks

mod shutdown;

pub use shutdown::ShutdownSignal;
