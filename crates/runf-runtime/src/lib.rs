//! # runf-runtime
//!
//! Container lifecycle on top of the `runf-core` primitives.
//!
//! A [`ContainerFactory`] provisions a [`Container`] from an isolation spec.
//! [`Container::run`] re-executes the runtime binary as the container's
//! init, drives the sync handshake with it, and returns a [`Process`] once
//! the target command is executing. [`Container::destroy`] (also run on
//! drop) releases everything exactly once.
//!
//! Binaries must call [`is_init_invocation`] first thing in `main` and hand
//! control to [`start_initialization`] when it returns `true`.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod error;
pub mod factory;
pub mod handshake;
pub mod init;
pub mod launcher;
pub mod state;

pub use container::Container;
pub use error::{CreateError, DestroyError, RunError, StartInitializationError, WaitError};
pub use factory::ContainerFactory;
pub use init::{is_init_invocation, start_initialization};
pub use launcher::{Process, ProcessSpec};
