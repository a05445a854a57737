//! # Services module
//!
//! This module provide services to assemble the kubernetes resources of a
//! mysql cluster, drive its formation and helpers to do so.
pub mod cfg;
pub mod crd;
pub mod exec;
pub mod http;
pub mod k8s;
pub mod mysqlsh;
pub mod topology;
