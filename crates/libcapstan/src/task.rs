//! One in-flight job and its state machine.
//!
//! A task is mutated only by the engine's packet-processing step, matched
//! either by job handle (after JOB_CREATED) or by the per-connection
//! submission slot before a handle exists.

use bytes::{BufMut, Bytes, BytesMut};
use capstan_core::packet::{JobHandle, Packet, Priority};

use crate::error::CapstanError;

/// Client-side task identifier, unique within one client instance.
pub type TaskId = u64;

/// Lifecycle of one task.
///
/// `New → Submitted → Created → Running → {Complete | Failed}` on the happy
/// path; `TimedOut` and `ConnError` can cut in at any non-terminal point.
/// A background task detaches at `Created`: the engine stops waiting on it
/// but its job handle stays valid for status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Submitted,
    Created,
    Running,
    Complete,
    Failed,
    TimedOut,
    ConnError,
}

#[derive(Debug)]
pub struct Task {
    id: TaskId,
    /// Namespace-prefixed function name, exactly as sent on the wire.
    function: Bytes,
    unique: Bytes,
    workload: Bytes,
    priority: Priority,
    background: bool,
    state: TaskState,
    /// Endpoint index the submission was sent on.
    conn: Option<usize>,
    handle: Option<JobHandle>,
    result: BytesMut,
    numerator: u32,
    denominator: u32,
    warnings: Vec<Bytes>,
    exceptions: Vec<Bytes>,
    error: Option<CapstanError>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        function: Bytes,
        unique: Bytes,
        workload: Bytes,
        priority: Priority,
        background: bool,
    ) -> Self {
        Self {
            id,
            function,
            unique,
            workload,
            priority,
            background,
            state: TaskState::New,
            conn: None,
            handle: None,
            result: BytesMut::new(),
            numerator: 0,
            denominator: 0,
            warnings: Vec::new(),
            exceptions: Vec::new(),
            error: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn function(&self) -> &[u8] {
        &self.function
    }

    pub fn unique(&self) -> &[u8] {
        &self.unique
    }

    pub fn workload(&self) -> &[u8] {
        &self.workload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn result(&self) -> &[u8] {
        &self.result
    }

    /// Progress as last reported by WORK_STATUS. `0/0` until a worker picks
    /// the job up.
    pub fn progress(&self) -> (u32, u32) {
        (self.numerator, self.denominator)
    }

    pub fn warnings(&self) -> &[Bytes] {
        &self.warnings
    }

    pub fn exceptions(&self) -> &[Bytes] {
        &self.exceptions
    }

    pub fn error(&self) -> Option<&CapstanError> {
        self.error.as_ref()
    }

    pub(crate) fn conn(&self) -> Option<usize> {
        self.conn
    }

    /// Bind the task to an endpoint. Happens at fan-out time, before the
    /// submission is actually written.
    pub(crate) fn assign(&mut self, conn: usize) {
        self.conn = Some(conn);
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = TaskState::Submitted;
    }

    /// The SUBMIT_JOB frame for this task.
    pub(crate) fn submit_packet(&self) -> Packet {
        Packet::SubmitJob {
            function: self.function.clone(),
            unique: self.unique.clone(),
            workload: self.workload.clone(),
            priority: self.priority,
            background: self.background,
        }
    }

    pub(crate) fn mark_created(&mut self, handle: JobHandle) {
        self.handle = Some(handle);
        self.state = TaskState::Created;
    }

    /// True once nothing further will arrive for this task within the
    /// current engine call. Background tasks detach at `Created`.
    pub fn is_finished(&self) -> bool {
        match self.state {
            TaskState::Complete
            | TaskState::Failed
            | TaskState::TimedOut
            | TaskState::ConnError => true,
            TaskState::Created | TaskState::Running => self.background,
            TaskState::New | TaskState::Submitted => false,
        }
    }

    /// Apply one response packet. The caller has already matched the packet
    /// to this task by handle.
    pub(crate) fn apply(&mut self, packet: &Packet) {
        match packet {
            Packet::WorkStatus {
                numerator,
                denominator,
                ..
            } => {
                self.numerator = *numerator;
                self.denominator = *denominator;
                self.state = TaskState::Running;
            }
            Packet::WorkData { data, .. } => {
                self.result.put_slice(data);
                self.state = TaskState::Running;
            }
            Packet::WorkWarning { message, .. } => {
                self.warnings.push(message.clone());
                self.state = TaskState::Running;
            }
            Packet::WorkException { payload, .. } => {
                // Exception text doubles as the result, preserving the
                // long-standing "on success, exception payload returned as
                // result" behavior.
                self.exceptions.push(payload.clone());
                self.result.clear();
                self.result.put_slice(payload);
                self.state = TaskState::Running;
            }
            Packet::WorkComplete { result, .. } => {
                self.result.put_slice(result);
                self.state = TaskState::Complete;
            }
            Packet::WorkFail { handle } => {
                self.state = TaskState::Failed;
                self.error = Some(CapstanError::WorkFail {
                    handle: handle.clone(),
                });
            }
            other => {
                tracing::warn!(command = other.command().name(), "packet not meaningful for a task");
            }
        }
    }

    /// Record a failure that did not come from a WORK_* packet.
    pub(crate) fn fail(&mut self, error: CapstanError) {
        self.state = if error.is_connection_failure() {
            TaskState::ConnError
        } else {
            TaskState::Failed
        };
        self.error = Some(error);
    }

    /// The deadline passed while this task was in flight.
    pub(crate) fn expire(&mut self) {
        if !self.is_finished() {
            self.state = TaskState::TimedOut;
            self.error = Some(CapstanError::Timeout);
        }
    }

    /// Consume the task into the caller-facing outcome of a synchronous
    /// `do`-style call.
    pub(crate) fn into_result(mut self) -> Result<Bytes, CapstanError> {
        match self.state {
            TaskState::Complete => Ok(self.result.freeze()),
            _ => Err(self.error.take().unwrap_or(CapstanError::Timeout)),
        }
    }
}
