//! Runtime plumbing shared by the worker loops

pub mod shutdown;

pub use shutdown::{ShutdownListener, ShutdownSignal};
