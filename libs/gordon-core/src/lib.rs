//! Gordon's orchestration core: the deployment reconciler that keeps the
//! route table and the container runtime in agreement, the docker CLI
//! runtime driver, and the registry `/v2` HTTP surface.

pub mod deploy;
pub mod docker;
pub mod registry;
