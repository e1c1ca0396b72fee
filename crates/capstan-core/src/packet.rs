//! Typed packets — one variant per frame kind the client core exchanges.
//!
//! The codec decodes straight into [`Packet`]; there is no intermediate
//! "command id plus argument list" shape. Worker-side frames (CAN_DO,
//! GRAB_JOB, ...) are recognized by the command table but refused here,
//! since a client connection must never see them.

use std::fmt;

use bytes::Bytes;

use crate::wire::{Command, PacketMagic};

// ── Job handles ──────────────────────────────────────────────────────────────

/// Server-assigned opaque identifier for a submitted job.
///
/// Valid once `JOB_CREATED` is received and thereafter usable for status
/// polling, including from a different client instance.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(Bytes);

impl JobHandle {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        JobHandle(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for JobHandle {
    fn from(s: &str) -> Self {
        JobHandle(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobHandle({})", self)
    }
}

// ── Priority ─────────────────────────────────────────────────────────────────

/// Submission priority. Selects among the SUBMIT_JOB command variants and
/// fixes the fan-out send order: high before normal before low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Send-order rank. Lower runs first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

// ── Packets ──────────────────────────────────────────────────────────────────

/// A decoded frame. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Job submission. Command code chosen from `priority` and `background`.
    SubmitJob {
        function: Bytes,
        unique: Bytes,
        workload: Bytes,
        priority: Priority,
        background: bool,
    },
    /// Server acknowledgment of a submission.
    JobCreated { handle: JobHandle },
    /// Progress report. Does not end the job.
    WorkStatus {
        handle: JobHandle,
        numerator: u32,
        denominator: u32,
    },
    /// Partial result bytes. May arrive any number of times before
    /// WORK_COMPLETE.
    WorkData { handle: JobHandle, data: Bytes },
    /// Non-fatal diagnostic from the worker.
    WorkWarning { handle: JobHandle, message: Bytes },
    /// Worker-raised exception payload. Does not end the job by itself.
    WorkException { handle: JobHandle, payload: Bytes },
    /// Successful completion with the final result bytes.
    WorkComplete { handle: JobHandle, result: Bytes },
    /// Worker-reported failure. Terminal, no result.
    WorkFail { handle: JobHandle },
    /// Status poll request for a background job.
    GetStatus { handle: JobHandle },
    /// Status poll response.
    StatusRes {
        handle: JobHandle,
        is_known: bool,
        is_running: bool,
        numerator: u32,
        denominator: u32,
    },
    EchoReq { payload: Bytes },
    EchoRes { payload: Bytes },
    /// Per-connection server behavior toggle (e.g. "exceptions").
    OptionReq { option: Bytes },
    OptionRes { option: Bytes },
    /// Server-reported protocol-level error.
    Error { code: Bytes, message: Bytes },
}

impl Packet {
    /// The command code this packet encodes as.
    pub fn command(&self) -> Command {
        match self {
            Packet::SubmitJob {
                priority,
                background,
                ..
            } => submit_command(*priority, *background),
            Packet::JobCreated { .. } => Command::JobCreated,
            Packet::WorkStatus { .. } => Command::WorkStatus,
            Packet::WorkData { .. } => Command::WorkData,
            Packet::WorkWarning { .. } => Command::WorkWarning,
            Packet::WorkException { .. } => Command::WorkException,
            Packet::WorkComplete { .. } => Command::WorkComplete,
            Packet::WorkFail { .. } => Command::WorkFail,
            Packet::GetStatus { .. } => Command::GetStatus,
            Packet::StatusRes { .. } => Command::StatusRes,
            Packet::EchoReq { .. } => Command::EchoReq,
            Packet::EchoRes { .. } => Command::EchoRes,
            Packet::OptionReq { .. } => Command::OptionReq,
            Packet::OptionRes { .. } => Command::OptionRes,
            Packet::Error { .. } => Command::Error,
        }
    }

    /// The magic this packet travels under.
    pub fn magic(&self) -> PacketMagic {
        match self {
            Packet::SubmitJob { .. }
            | Packet::GetStatus { .. }
            | Packet::EchoReq { .. }
            | Packet::OptionReq { .. } => PacketMagic::Request,
            _ => PacketMagic::Response,
        }
    }
}

/// Map (priority, background) onto the six SUBMIT_JOB command codes.
pub fn submit_command(priority: Priority, background: bool) -> Command {
    match (priority, background) {
        (Priority::Normal, false) => Command::SubmitJob,
        (Priority::Normal, true) => Command::SubmitJobBg,
        (Priority::High, false) => Command::SubmitJobHigh,
        (Priority::High, true) => Command::SubmitJobHighBg,
        (Priority::Low, false) => Command::SubmitJobLow,
        (Priority::Low, true) => Command::SubmitJobLowBg,
    }
}

/// Recover (priority, background) from a SUBMIT_JOB command code.
/// Returns `None` for non-submission commands.
pub fn submit_flavor(command: Command) -> Option<(Priority, bool)> {
    match command {
        Command::SubmitJob => Some((Priority::Normal, false)),
        Command::SubmitJobBg => Some((Priority::Normal, true)),
        Command::SubmitJobHigh => Some((Priority::High, false)),
        Command::SubmitJobHighBg => Some((Priority::High, true)),
        Command::SubmitJobLow => Some((Priority::Low, false)),
        Command::SubmitJobLowBg => Some((Priority::Low, true)),
        _ => None,
    }
}
