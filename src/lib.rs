//! vastnfs-k8s: lifecycle of the VAST NFS kernel module on Kubernetes nodes
//!
//! Inspects every node, unloads the in-kernel NFS stack where needed, applies
//! the module loader workload and follows its workers until they finish.

pub mod cli;
pub mod config;
pub mod deploy;
pub mod kube;
pub mod module;
