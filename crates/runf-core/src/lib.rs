//! # runf-core
//!
//! Low-level Linux isolation primitives for the runf runtime.
//!
//! This crate provides:
//! - **Isolation specs**: the validated, immutable description of a container.
//! - **Namespaces**: namespace kinds, clone flags, and UID/GID mappings.
//! - **Cgroups v2**: per-container hierarchies and CPU, memory, I/O, pids limits.
//! - **Filesystem**: mounts, device nodes, masked paths, and `pivot_root`.
//! - **Capabilities** and **rlimits** applied before the target command runs.
//! - **Providers**: the [`provider::IsolationProvider`] seam through which
//!   every kernel interaction flows, with one Linux implementation.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod process;
pub mod provider;
pub mod rlimit;
pub mod spec;
