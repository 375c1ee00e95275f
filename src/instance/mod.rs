//! Instances and their registry
//!
//! Every configured proxy runs inside an [`Instance`], which owns its
//! lifecycle status and statistics. The [`InstanceManager`] keeps instances by
//! name and starts or stops them in bulk.

pub mod instance;
pub mod manager;
pub mod status;

pub use instance::{create_proxy, Instance};
pub use manager::InstanceManager;
pub use status::Status;
