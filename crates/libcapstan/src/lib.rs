//! Client engine for capstan job-queue servers.
//!
//! Everything runs inside the caller's `.await`: the [`Client`] drives its
//! sockets only while a call is being polled, so there is no background
//! runtime state to manage. Submit work with [`Client::do_job`] or the
//! [`Client::add_task`] / [`Client::run_tasks`] pair, detach jobs with
//! [`Client::do_background`] and poll them via [`Client::job_status`], or
//! scatter-gather with [`MapReduce`].

pub mod client;
mod conn;
pub mod error;
pub mod log;
pub mod map_reduce;
pub mod options;
pub mod task;

pub use client::{Client, JobStatus, StatusPoll};
pub use error::CapstanError;
pub use log::Verbosity;
pub use map_reduce::MapReduce;
pub use options::{ClientOptions, Opt};
pub use task::{Task, TaskId, TaskState};

pub use capstan_core::config::ClientConfig;
pub use capstan_core::packet::{JobHandle, Priority};
