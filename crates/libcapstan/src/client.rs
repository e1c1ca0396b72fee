//! The task engine.
//!
//! A [`Client`] owns a set of server endpoints, a set of in-flight tasks and
//! the multiplex loop that moves bytes between them. All progress happens
//! inside the caller's `.await`: the engine never spawns, so a dropped future
//! simply stops driving I/O and nothing runs behind the caller's back.
//!
//! Fan-out is round-robin across endpoints, high-priority tasks first. Each
//! endpoint carries at most one submission awaiting JOB_CREATED at a time;
//! everything after the acknowledgment is correlated by job handle instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use capstan_core::config::ClientConfig;
use capstan_core::packet::{JobHandle, Packet, Priority};
use capstan_core::wire::{WireError, DEFAULT_PORT, MAX_UNIQUE_SIZE};
use futures::future::select_all;

use crate::conn::ServerConn;
use crate::error::CapstanError;
use crate::log::{LogFn, LogSink, Verbosity};
use crate::options::{ClientOptions, Opt};
use crate::task::{Task, TaskId, TaskState};

// ── Status polling ───────────────────────────────────────────────────────────

/// Answer to a GET_STATUS poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    /// False once the job has finished or was never submitted here.
    pub is_known: bool,
    pub is_running: bool,
    pub numerator: u32,
    pub denominator: u32,
}

/// Outcome of one [`Client::job_status`] call.
///
/// A non-blocking client gets `Retry` when the response has not arrived yet
/// and polls again; a blocking client only ever sees `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPoll {
    Done(JobStatus),
    Retry,
}

struct PendingStatus {
    handle: JobHandle,
    response: Option<JobStatus>,
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Per-endpoint submission bookkeeping. `awaiting` enforces the one
/// outstanding SUBMIT_JOB per connection that handle correlation requires.
#[derive(Default)]
struct Lane {
    queue: VecDeque<TaskId>,
    awaiting: Option<TaskId>,
}

/// A job-queue client: endpoint list, task set and the engine that drives
/// them.
pub struct Client {
    conns: Vec<ServerConn>,
    lanes: Vec<Lane>,
    tasks: Vec<Task>,
    next_task_id: TaskId,
    /// Round-robin cursor for fan-out.
    next_conn: usize,
    namespace: Bytes,
    options: ClientOptions,
    timeout: Option<Duration>,
    log: Option<LogSink>,
    last_handle: Option<JobHandle>,
    /// Endpoint each handle came from, so status polls go back to the server
    /// that owns the job.
    handle_origin: HashMap<JobHandle, usize>,
    pending_status: Vec<PendingStatus>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self {
            conns: Vec::new(),
            lanes: Vec::new(),
            tasks: Vec::new(),
            next_task_id: 0,
            next_conn: 0,
            namespace: Bytes::new(),
            options: ClientOptions::default(),
            timeout: None,
            log: None,
            last_handle: None,
            handle_origin: HashMap::new(),
            pending_status: Vec::new(),
        }
    }

    /// Build a client from the loaded configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut client = Self::new();
        if !config.servers.is_empty() {
            client.add_servers(&config.servers);
        }
        client.set_timeout_ms(config.timeout_ms);
        client.set_namespace(config.namespace.as_bytes());
        client
    }

    /// A new client sharing this one's endpoint list, namespace, options,
    /// timeout and log callback, but no tasks and no open sockets.
    pub fn clone_client(&self) -> Self {
        let mut clone = Self::new();
        for conn in &self.conns {
            clone.add_server(conn.host(), conn.port());
        }
        clone.namespace = self.namespace.clone();
        clone.options = self.options.clone();
        clone.timeout = self.timeout;
        clone.log = self.log.clone();
        clone
    }

    // ── Endpoints ────────────────────────────────────────────────────────────

    /// Register an endpoint. No connection is attempted until first use.
    pub fn add_server(&mut self, host: &str, port: u16) {
        self.conns.push(ServerConn::new(host, port));
        self.lanes.push(Lane::default());
    }

    /// Register a comma-separated `host[:port]` list. Entries without a port
    /// get the protocol default, as does a port that fails to parse; empty
    /// entries are skipped. Hosts are names or IPv4 addresses: the split is
    /// on the last `:`, so an IPv6 literal must be given as a resolvable
    /// name instead.
    pub fn add_servers(&mut self, list: &str) {
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse().unwrap_or(DEFAULT_PORT);
                    self.add_server(host, port);
                }
                None => self.add_server(entry, DEFAULT_PORT),
            }
        }
    }

    pub fn endpoints(&self) -> Vec<(String, u16)> {
        self.conns
            .iter()
            .map(|c| (c.host().to_string(), c.port()))
            .collect()
    }

    /// Health snapshot per endpoint: address, whether a socket is open, and
    /// the most recent transport error if one was recorded.
    pub fn endpoint_status(&self) -> Vec<(String, bool, Option<String>)> {
        self.conns
            .iter()
            .map(|c| {
                (
                    c.addr_label(),
                    c.is_connected(),
                    c.last_error().map(str::to_string),
                )
            })
            .collect()
    }

    // ── Knobs ────────────────────────────────────────────────────────────────

    /// Wall-clock budget for each blocking call. Negative means no limit.
    pub fn set_timeout_ms(&mut self, ms: i64) {
        self.timeout = if ms < 0 {
            None
        } else {
            Some(Duration::from_millis(ms as u64))
        };
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Prefix prepended to every function name on the wire. Empty clears it.
    pub fn set_namespace(&mut self, namespace: &[u8]) {
        self.namespace = Bytes::copy_from_slice(namespace);
    }

    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: ClientOptions) {
        self.options.set(options);
    }

    pub fn add_option(&mut self, opt: Opt) {
        self.options.add(opt);
    }

    pub fn remove_option(&mut self, opt: Opt) {
        self.options.remove(opt);
    }

    /// Install the log callback. Lines at or below `max` are delivered.
    pub fn set_log_fn(
        &mut self,
        callback: impl Fn(&str, Verbosity) + Send + Sync + 'static,
        max: Verbosity,
    ) {
        let callback: Arc<LogFn> = Arc::new(callback);
        self.log = Some(LogSink::new(callback, max));
    }

    /// Handle of the most recently acknowledged submission.
    pub fn last_job_handle(&self) -> Option<&JobHandle> {
        self.last_handle.as_ref()
    }

    // ── Task inspection ──────────────────────────────────────────────────────

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn take_task(&mut self, id: TaskId) -> Option<Task> {
        self.remove_task(id)
    }

    /// Remove and return every finished task.
    pub fn take_finished(&mut self) -> Vec<Task> {
        let mut done = Vec::new();
        let mut rest = Vec::new();
        for task in self.tasks.drain(..) {
            if task.is_finished() {
                done.push(task);
            } else {
                rest.push(task);
            }
        }
        self.tasks = rest;
        done
    }

    // ── Task creation ────────────────────────────────────────────────────────

    /// Queue a foreground task. Runs when [`run_tasks`] is next driven.
    ///
    /// [`run_tasks`]: Client::run_tasks
    pub fn add_task(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
        priority: Priority,
    ) -> Result<TaskId, CapstanError> {
        self.create_task(function, unique, workload.into(), priority, false)
    }

    /// Queue a background task. Finishes at JOB_CREATED; the worker runs
    /// detached.
    pub fn add_task_background(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
        priority: Priority,
    ) -> Result<TaskId, CapstanError> {
        self.create_task(function, unique, workload.into(), priority, true)
    }

    pub(crate) fn create_task(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: Bytes,
        priority: Priority,
        background: bool,
    ) -> Result<TaskId, CapstanError> {
        if self.options.no_new {
            return Err(CapstanError::NoNewTasks);
        }
        let unique = match unique {
            Some(u) => {
                if u.len() > MAX_UNIQUE_SIZE {
                    return Err(CapstanError::ArgumentTooLarge {
                        what: "unique",
                        len: u.len(),
                        max: MAX_UNIQUE_SIZE,
                    });
                }
                Bytes::copy_from_slice(u.as_bytes())
            }
            None => generated_unique(),
        };
        let mut name = BytesMut::with_capacity(self.namespace.len() + function.len());
        name.put_slice(&self.namespace);
        name.put_slice(function.as_bytes());

        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.push(Task::new(
            id,
            name.freeze(),
            unique,
            workload,
            priority,
            background,
        ));
        self.log(Verbosity::Debug, || format!("task {id} queued for {function}"));
        Ok(id)
    }

    // ── One-shot operations ──────────────────────────────────────────────────

    /// Submit one job and wait for its result.
    pub async fn do_job(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
    ) -> Result<Bytes, CapstanError> {
        self.do_with(function, unique, workload.into(), Priority::Normal)
            .await
    }

    pub async fn do_high(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
    ) -> Result<Bytes, CapstanError> {
        self.do_with(function, unique, workload.into(), Priority::High)
            .await
    }

    pub async fn do_low(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
    ) -> Result<Bytes, CapstanError> {
        self.do_with(function, unique, workload.into(), Priority::Low)
            .await
    }

    pub(crate) async fn do_with(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: Bytes,
        priority: Priority,
    ) -> Result<Bytes, CapstanError> {
        let id = self.create_task(function, unique, workload, priority, false)?;
        let task = self.finish_one(id).await?;
        task.into_result()
    }

    /// Submit a detached job and return its handle once the server
    /// acknowledges it.
    pub async fn do_background(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
    ) -> Result<JobHandle, CapstanError> {
        self.do_background_with(function, unique, workload.into(), Priority::Normal)
            .await
    }

    pub async fn do_high_background(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
    ) -> Result<JobHandle, CapstanError> {
        self.do_background_with(function, unique, workload.into(), Priority::High)
            .await
    }

    pub async fn do_low_background(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: impl Into<Bytes>,
    ) -> Result<JobHandle, CapstanError> {
        self.do_background_with(function, unique, workload.into(), Priority::Low)
            .await
    }

    async fn do_background_with(
        &mut self,
        function: &str,
        unique: Option<&str>,
        workload: Bytes,
        priority: Priority,
    ) -> Result<JobHandle, CapstanError> {
        let id = self.create_task(function, unique, workload, priority, true)?;
        let task = self.finish_one(id).await?;
        match task.handle() {
            Some(handle) => Ok(handle.clone()),
            None => Err(task
                .into_result()
                .err()
                .unwrap_or(CapstanError::Timeout)),
        }
    }

    /// Drive one task to its finished state and hand it back, leaving every
    /// other task in place.
    async fn finish_one(&mut self, id: TaskId) -> Result<Task, CapstanError> {
        let run = self.run_tasks_inner(&[id], None).await;
        match self.remove_task(id) {
            Some(task) if task.is_finished() => Ok(task),
            _ => {
                run?;
                Err(CapstanError::Timeout)
            }
        }
    }

    // ── Status polling ───────────────────────────────────────────────────────

    /// Poll a job's server-side status.
    ///
    /// Blocking clients wait for the STATUS_RES and always get
    /// [`StatusPoll::Done`]. With [`Opt::NonBlocking`] set, the request is
    /// sent once and each call drains whatever has arrived, answering
    /// [`StatusPoll::Retry`] until the response shows up.
    pub async fn job_status(&mut self, handle: &JobHandle) -> Result<StatusPoll, CapstanError> {
        if self.conns.is_empty() {
            return Err(CapstanError::NoServers);
        }
        let deadline = self.deadline();

        if !self.pending_status.iter().any(|p| &p.handle == handle) {
            let idx = self.handle_origin.get(handle).copied().unwrap_or(0);
            let request = Packet::GetStatus {
                handle: handle.clone(),
            };
            self.log_packet("send", &request, idx);
            let sent = {
                let conn = &mut self.conns[idx];
                match conn.queue_packet(&request) {
                    Ok(()) => bounded(deadline, conn.flush()).await,
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = sent {
                if !matches!(e, CapstanError::Timeout) {
                    self.fail_endpoint(idx, e.clone());
                }
                return Err(e);
            }
            self.pending_status.push(PendingStatus {
                handle: handle.clone(),
                response: None,
            });
        }

        if self.options.non_blocking {
            self.service_connections();
            return Ok(match self.take_status(handle) {
                Some(status) => StatusPoll::Done(status),
                None => StatusPoll::Retry,
            });
        }

        loop {
            self.service_connections();
            if let Some(status) = self.take_status(handle) {
                return Ok(StatusPoll::Done(status));
            }
            let limit = remaining(deadline)?;
            if !self.wait_readable(limit).await {
                return Err(CapstanError::Timeout);
            }
        }
    }

    fn take_status(&mut self, handle: &JobHandle) -> Option<JobStatus> {
        let pos = self
            .pending_status
            .iter()
            .position(|p| &p.handle == handle && p.response.is_some())?;
        self.pending_status.remove(pos).response
    }

    // ── Health and per-connection options ────────────────────────────────────

    /// Round-trip a payload through every endpoint. Any transport failure or
    /// server error surfaces as-is.
    pub async fn echo(&mut self, payload: &[u8]) -> Result<(), CapstanError> {
        if self.conns.is_empty() {
            return Err(CapstanError::NoServers);
        }
        let payload = Bytes::copy_from_slice(payload);
        for idx in 0..self.conns.len() {
            let request = Packet::EchoReq {
                payload: payload.clone(),
            };
            match self.exchange_on(idx, request).await? {
                Packet::EchoRes { .. } => {}
                other => {
                    return Err(CapstanError::Protocol(WireError::UnexpectedCommand {
                        command: other.command().name(),
                    }))
                }
            }
        }
        Ok(())
    }

    /// Ask every endpoint to enable a server-side option (e.g.
    /// `"exceptions"`). The server answers OPTION_RES on success and ERROR
    /// for options it does not know.
    pub async fn server_option(&mut self, option: &str) -> Result<(), CapstanError> {
        if self.conns.is_empty() {
            return Err(CapstanError::NoServers);
        }
        let option = Bytes::copy_from_slice(option.as_bytes());
        for idx in 0..self.conns.len() {
            let request = Packet::OptionReq {
                option: option.clone(),
            };
            match self.exchange_on(idx, request).await? {
                Packet::OptionRes { .. } => {}
                other => {
                    return Err(CapstanError::Protocol(WireError::UnexpectedCommand {
                        command: other.command().name(),
                    }))
                }
            }
        }
        Ok(())
    }

    /// Send one request on one endpoint and wait for its direct reply.
    /// Unrelated traffic that arrives in between is dispatched normally.
    async fn exchange_on(&mut self, idx: usize, request: Packet) -> Result<Packet, CapstanError> {
        let deadline = self.deadline();
        self.log_packet("send", &request, idx);
        {
            let conn = &mut self.conns[idx];
            conn.queue_packet(&request)?;
            bounded(deadline, conn.flush()).await?;
        }
        loop {
            match self.conns[idx].try_recv() {
                Ok(Some(reply)) => match reply {
                    Packet::EchoRes { .. } | Packet::OptionRes { .. } => {
                        self.log_packet("recv", &reply, idx);
                        return Ok(reply);
                    }
                    Packet::Error { code, message } => {
                        return Err(CapstanError::Server {
                            code: String::from_utf8_lossy(&code).into_owned(),
                            message: String::from_utf8_lossy(&message).into_owned(),
                        })
                    }
                    other => self.dispatch(idx, other),
                },
                Ok(None) => {
                    let limit = remaining(deadline)?;
                    let wait = self.conns[idx].readable();
                    match limit {
                        None => wait.await,
                        Some(d) => {
                            if tokio::time::timeout(d, wait).await.is_err() {
                                return Err(CapstanError::Timeout);
                            }
                        }
                    }
                }
                Err(e) => {
                    self.fail_endpoint(idx, e.clone());
                    return Err(e);
                }
            }
        }
    }

    // ── The multiplex loop ───────────────────────────────────────────────────

    /// Drive every queued task to a finished state.
    ///
    /// On timeout the unfinished tasks are marked `TimedOut` and the call
    /// returns [`CapstanError::Timeout`]; connections stay open and a later
    /// call picks up where this one left off.
    pub async fn run_tasks(&mut self) -> Result<(), CapstanError> {
        self.run_tasks_inner(&[], None).await
    }

    /// Like [`run_tasks`] but stops as soon as any of the watched tasks
    /// fails, leaving the remaining tasks wherever they are.
    ///
    /// [`run_tasks`]: Client::run_tasks
    pub(crate) async fn run_until_failure(
        &mut self,
        watched: &[TaskId],
    ) -> Result<(), CapstanError> {
        self.run_tasks_inner(watched, Some(watched)).await
    }

    async fn run_tasks_inner(
        &mut self,
        protect: &[TaskId],
        watch_failure: Option<&[TaskId]>,
    ) -> Result<(), CapstanError> {
        if self.conns.is_empty() {
            return Err(CapstanError::NoServers);
        }
        let deadline = self.deadline();
        self.assign_new_tasks();

        loop {
            if let Err(e) = self.pump_submissions(deadline).await {
                if matches!(e, CapstanError::Timeout) {
                    self.expire_tasks();
                }
                return Err(e);
            }
            let progressed = self.service_connections();

            if let Some(watched) = watch_failure {
                let tripped = self.tasks.iter().any(|t| {
                    watched.contains(&t.id())
                        && matches!(t.state(), TaskState::Failed | TaskState::ConnError)
                });
                if tripped {
                    return Ok(());
                }
            }
            if self.tasks.iter().all(Task::is_finished) {
                if self.options.free_tasks {
                    self.tasks
                        .retain(|t| !t.is_finished() || protect.contains(&t.id()));
                }
                return Ok(());
            }
            if progressed {
                continue;
            }

            let limit = match remaining(deadline) {
                Ok(limit) => limit,
                Err(e) => {
                    self.expire_tasks();
                    return Err(e);
                }
            };
            if !self.wait_readable(limit).await {
                self.expire_tasks();
                return Err(CapstanError::Timeout);
            }
        }
    }

    /// Hand fresh tasks to endpoints: high priority first, round-robin
    /// across the endpoint list.
    fn assign_new_tasks(&mut self) {
        let mut fresh: Vec<(u8, TaskId)> = self
            .tasks
            .iter()
            .filter(|t| t.state() == TaskState::New && t.conn().is_none())
            .map(|t| (t.priority().rank(), t.id()))
            .collect();
        // Stable, so same-priority tasks keep submission order.
        fresh.sort_by_key(|&(rank, _)| rank);

        for (_, id) in fresh {
            let idx = self.next_conn;
            self.next_conn = (self.next_conn + 1) % self.conns.len();
            if let Some(task) = self.task_mut(id) {
                task.assign(idx);
            }
            self.lanes[idx].queue.push_back(id);
            self.log(Verbosity::Debug, || {
                format!("task {id} assigned to endpoint {idx}")
            });
        }
    }

    /// Send the head of each idle lane. A lane with a submission awaiting
    /// JOB_CREATED is left alone until the acknowledgment frees it.
    async fn pump_submissions(&mut self, deadline: Option<Instant>) -> Result<(), CapstanError> {
        for idx in 0..self.conns.len() {
            if self.lanes[idx].awaiting.is_some() {
                continue;
            }
            let Some(&next) = self.lanes[idx].queue.front() else {
                continue;
            };
            let Some(packet) = self
                .tasks
                .iter()
                .find(|t| t.id() == next)
                .map(Task::submit_packet)
            else {
                self.lanes[idx].queue.pop_front();
                continue;
            };
            self.log_packet("send", &packet, idx);
            if let Err(e) = self.conns[idx].queue_packet(&packet) {
                // Encode failure is the task's fault, not the endpoint's.
                self.lanes[idx].queue.pop_front();
                if let Some(task) = self.task_mut(next) {
                    task.fail(e);
                }
                continue;
            }
            match bounded(deadline, self.conns[idx].flush()).await {
                Ok(()) => {
                    self.lanes[idx].queue.pop_front();
                    self.lanes[idx].awaiting = Some(next);
                    if let Some(task) = self.task_mut(next) {
                        task.mark_submitted();
                    }
                }
                Err(CapstanError::Timeout) => return Err(CapstanError::Timeout),
                Err(e) => self.fail_endpoint(idx, e),
            }
        }
        Ok(())
    }

    /// Drain every endpoint's receive side without waiting. Returns whether
    /// anything arrived.
    fn service_connections(&mut self) -> bool {
        let mut progressed = false;
        for idx in 0..self.conns.len() {
            loop {
                match self.conns[idx].try_recv() {
                    Ok(Some(packet)) => {
                        progressed = true;
                        self.dispatch(idx, packet);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        progressed = true;
                        self.fail_endpoint(idx, e);
                        break;
                    }
                }
            }
        }
        progressed
    }

    /// Route one received packet to the task or poll that owns it.
    fn dispatch(&mut self, idx: usize, packet: Packet) {
        self.log_packet("recv", &packet, idx);
        match packet {
            Packet::JobCreated { handle } => {
                let Some(id) = self.lanes[idx].awaiting.take() else {
                    tracing::warn!(endpoint = idx, %handle, "JOB_CREATED with nothing awaiting it");
                    return;
                };
                self.handle_origin.insert(handle.clone(), idx);
                self.last_handle = Some(handle.clone());
                self.log(Verbosity::Debug, || format!("job {handle} created for task {id}"));
                if let Some(task) = self.task_mut(id) {
                    task.mark_created(handle);
                }
            }
            Packet::StatusRes {
                handle,
                is_known,
                is_running,
                numerator,
                denominator,
            } => {
                let status = JobStatus {
                    is_known,
                    is_running,
                    numerator,
                    denominator,
                };
                match self
                    .pending_status
                    .iter_mut()
                    .find(|p| p.handle == handle && p.response.is_none())
                {
                    Some(pending) => pending.response = Some(status),
                    None => tracing::debug!(%handle, "unsolicited STATUS_RES"),
                }
            }
            Packet::Error { code, message } => {
                let error = CapstanError::Server {
                    code: String::from_utf8_lossy(&code).into_owned(),
                    message: String::from_utf8_lossy(&message).into_owned(),
                };
                if let Some(id) = self.lanes[idx].awaiting.take() {
                    if let Some(task) = self.task_mut(id) {
                        task.fail(error);
                    }
                } else {
                    tracing::warn!(endpoint = idx, %error, "server error outside a submission");
                }
            }
            Packet::WorkStatus { ref handle, .. }
            | Packet::WorkData { ref handle, .. }
            | Packet::WorkWarning { ref handle, .. }
            | Packet::WorkException { ref handle, .. }
            | Packet::WorkComplete { ref handle, .. }
            | Packet::WorkFail { ref handle } => {
                match self.tasks.iter_mut().find(|t| t.handle() == Some(handle)) {
                    Some(task) => task.apply(&packet),
                    None => tracing::debug!(
                        %handle,
                        command = packet.command().name(),
                        "result for a job no task owns"
                    ),
                }
            }
            other => {
                tracing::debug!(
                    endpoint = idx,
                    command = other.command().name(),
                    "unexpected packet"
                );
            }
        }
    }

    /// Wait until any live endpoint has bytes, up to `limit`. False means
    /// the wait expired (or nothing is left to wait on).
    async fn wait_readable(&self, limit: Option<Duration>) -> bool {
        let waits: Vec<_> = self
            .conns
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| Box::pin(c.readable()))
            .collect();
        if waits.is_empty() {
            return false;
        }
        match limit {
            None => {
                select_all(waits).await;
                true
            }
            Some(limit) => tokio::time::timeout(limit, select_all(waits)).await.is_ok(),
        }
    }

    /// Kill one endpoint and fail every unfinished task bound to it. Other
    /// endpoints and their tasks are untouched.
    fn fail_endpoint(&mut self, idx: usize, error: CapstanError) {
        tracing::warn!(endpoint = idx, %error, "endpoint failed");
        self.log(Verbosity::Error, || {
            format!("endpoint {idx} failed: {error}")
        });
        self.conns[idx].mark_dead();
        self.lanes[idx].queue.clear();
        self.lanes[idx].awaiting = None;
        for task in self.tasks.iter_mut() {
            if task.conn() == Some(idx) && !task.is_finished() {
                task.fail(error.clone());
            }
        }
    }

    /// Time out every unfinished task and drop lane bookkeeping. Sockets
    /// stay open for the next call.
    fn expire_tasks(&mut self) {
        for task in self.tasks.iter_mut() {
            task.expire();
        }
        for lane in &mut self.lanes {
            lane.queue.clear();
            lane.awaiting = None;
        }
    }

    pub(crate) fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.id() == id)?;
        for lane in &mut self.lanes {
            lane.queue.retain(|&queued| queued != id);
            if lane.awaiting == Some(id) {
                lane.awaiting = None;
            }
        }
        Some(self.tasks.remove(pos))
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id() == id)
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    fn log(&self, verbosity: Verbosity, line: impl FnOnce() -> String) {
        if let Some(sink) = &self.log {
            if sink.wants(verbosity) {
                sink.emit(verbosity, &line());
            }
        }
    }

    fn log_packet(&self, direction: &str, packet: &Packet, idx: usize) {
        tracing::trace!(
            direction,
            endpoint = idx,
            command = packet.command().name(),
            "packet"
        );
        self.log(Verbosity::Crazy, || {
            format!("{direction} {} endpoint {idx}", packet.command().name())
        });
    }
}

// ── Deadline plumbing ────────────────────────────────────────────────────────

/// Time left until `deadline`, or `Timeout` if it already passed.
fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, CapstanError> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(CapstanError::Timeout)
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

/// Run a fallible future under the remaining deadline budget.
async fn bounded<T, F>(deadline: Option<Instant>, fut: F) -> Result<T, CapstanError>
where
    F: std::future::Future<Output = Result<T, CapstanError>>,
{
    match remaining(deadline)? {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CapstanError::Timeout)?,
    }
}

fn generated_unique() -> Bytes {
    Bytes::from(format!("{:032x}", rand::random::<u128>()))
}
