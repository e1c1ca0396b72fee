//! Integration test harness.
//!
//! Every test talks to [`MockServer`], an in-process job server speaking the
//! real wire protocol on a loopback TCP socket. Workers are plain closures
//! registered per function name; their replies choose which WORK_* frames go
//! back, including artificial delays to force out-of-order completion.
//!
//! Each test starts its own server(s), so tests are independent and run in
//! parallel.

mod background;
mod tasks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use capstan_core::codec::{decode_packet, encode_packet, Decoded};
use capstan_core::packet::{JobHandle, Packet};
use libcapstan::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// ── Harness ───────────────────────────────────────────────────────────────────

/// What a registered worker does with one job.
pub enum WorkerReply {
    Complete(Vec<u8>),
    /// WORK_DATA chunks, then WORK_COMPLETE with the final bytes.
    Chunked(Vec<Vec<u8>>, Vec<u8>),
    /// WORK_STATUS, then WORK_COMPLETE.
    Progress(u32, u32, Vec<u8>),
    /// WORK_WARNING, then WORK_COMPLETE.
    Warn(Vec<u8>, Vec<u8>),
    Fail,
    /// WORK_EXCEPTION, then WORK_FAIL.
    Exception(Vec<u8>),
    /// Sleep first, then act as the inner reply. Lets a test pick the
    /// completion order independently of the submission order.
    Delayed(Duration, Box<WorkerReply>),
}

type WorkerFn = dyn Fn(&[u8]) -> WorkerReply + Send + Sync;

#[derive(Default)]
struct ServerState {
    workers: Mutex<HashMap<String, Arc<WorkerFn>>>,
    /// Background jobs the server still knows about:
    /// handle bytes → (running, numerator, denominator).
    bg_status: Mutex<HashMap<Vec<u8>, (bool, u32, u32)>>,
    /// Delay before a background job executes, per function name.
    bg_delay: Mutex<HashMap<String, Duration>>,
    /// Workloads in SUBMIT_JOB arrival order.
    submissions: Mutex<Vec<Vec<u8>>>,
    /// (function, workload) in execution-completion order.
    executed: Mutex<Vec<(String, Vec<u8>)>>,
    next_handle: AtomicU64,
}

pub struct MockServer {
    pub port: u16,
    state: Arc<ServerState>,
}

static DIAGNOSTICS: Once = Once::new();

/// Route the library's `tracing` output to stderr when asked for, e.g.
/// `RUST_LOG=libcapstan=trace cargo test -p integration`.
fn init_diagnostics() {
    DIAGNOSTICS.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl MockServer {
    pub async fn start() -> Result<Self> {
        init_diagnostics();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(ServerState::default());
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve(socket, Arc::clone(&accept_state)));
            }
        });
        Ok(Self { port, state })
    }

    /// Register the worker for a function name.
    pub fn worker(
        &self,
        name: &str,
        worker: impl Fn(&[u8]) -> WorkerReply + Send + Sync + 'static,
    ) {
        self.state
            .workers
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(worker));
    }

    /// Hold background jobs for this function in the queue for `delay`
    /// before executing them.
    pub fn delay_background(&self, name: &str, delay: Duration) {
        self.state
            .bg_delay
            .lock()
            .unwrap()
            .insert(name.to_string(), delay);
    }

    /// A fresh client pointed at this server.
    pub fn client(&self) -> Client {
        let mut client = Client::new();
        client.add_server("127.0.0.1", self.port);
        client
    }

    /// Workloads in SUBMIT_JOB arrival order.
    pub fn submissions(&self) -> Vec<Vec<u8>> {
        self.state.submissions.lock().unwrap().clone()
    }

    /// (function, workload) pairs in the order jobs actually finished.
    pub fn executed(&self) -> Vec<(String, Vec<u8>)> {
        self.state.executed.lock().unwrap().clone()
    }
}

/// A loopback port with nothing listening on it. Connections get refused.
pub async fn dead_endpoint_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

// ── Server internals ──────────────────────────────────────────────────────────

async fn serve(socket: TcpStream, state: Arc<ServerState>) {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let Ok(frame) = encode_packet(&packet) else {
                break;
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::new();
    loop {
        match decode_packet(&mut buf) {
            Ok(Decoded::Packet(packet)) => {
                handle_packet(packet, &state, &tx);
                continue;
            }
            Ok(Decoded::Need(_)) => {}
            Err(_) => break,
        }
        let mut chunk = [0u8; 4096];
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn handle_packet(packet: Packet, state: &Arc<ServerState>, tx: &mpsc::UnboundedSender<Packet>) {
    match packet {
        Packet::SubmitJob {
            function,
            workload,
            background,
            ..
        } => {
            let name = String::from_utf8_lossy(&function).into_owned();
            let n = state.next_handle.fetch_add(1, Ordering::Relaxed);
            let handle = JobHandle::new(format!("H:mock:{n}"));
            state.submissions.lock().unwrap().push(workload.to_vec());
            let _ = tx.send(Packet::JobCreated {
                handle: handle.clone(),
            });
            if background {
                run_background(state, handle, name, workload);
            } else {
                run_foreground(state, tx.clone(), handle, name, workload);
            }
        }
        Packet::GetStatus { handle } => {
            let status = state
                .bg_status
                .lock()
                .unwrap()
                .get(handle.as_bytes())
                .copied();
            let (is_known, is_running, numerator, denominator) = match status {
                Some((running, num, den)) => (true, running, num, den),
                None => (false, false, 0, 0),
            };
            let _ = tx.send(Packet::StatusRes {
                handle,
                is_known,
                is_running,
                numerator,
                denominator,
            });
        }
        Packet::EchoReq { payload } => {
            let _ = tx.send(Packet::EchoRes { payload });
        }
        Packet::OptionReq { option } => {
            if option.as_ref() == b"reject-me" {
                let _ = tx.send(Packet::Error {
                    code: Bytes::from_static(b"ERR_UNKNOWN_OPTION"),
                    message: Bytes::from_static(b"unknown option"),
                });
            } else {
                let _ = tx.send(Packet::OptionRes { option });
            }
        }
        _ => {}
    }
}

fn run_foreground(
    state: &Arc<ServerState>,
    tx: mpsc::UnboundedSender<Packet>,
    handle: JobHandle,
    name: String,
    workload: Bytes,
) {
    let Some(worker) = state.workers.lock().unwrap().get(&name).cloned() else {
        let _ = tx.send(Packet::WorkFail { handle });
        return;
    };
    match worker(&workload) {
        WorkerReply::Delayed(delay, inner) => {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                state
                    .executed
                    .lock()
                    .unwrap()
                    .push((name, workload.to_vec()));
                send_reply(*inner, handle, &tx);
            });
        }
        reply => {
            state
                .executed
                .lock()
                .unwrap()
                .push((name, workload.to_vec()));
            send_reply(reply, handle, &tx);
        }
    }
}

fn run_background(state: &Arc<ServerState>, handle: JobHandle, name: String, workload: Bytes) {
    let delay = state.bg_delay.lock().unwrap().get(&name).copied();
    let key = handle.as_bytes().to_vec();
    state
        .bg_status
        .lock()
        .unwrap()
        .insert(key.clone(), (false, 0, 0));
    let worker = state.workers.lock().unwrap().get(&name).cloned();
    let state = Arc::clone(state);
    let finish = move || {
        if let Some(worker) = worker {
            let _ = worker(&workload);
            state
                .executed
                .lock()
                .unwrap()
                .push((name, workload.to_vec()));
        }
        state.bg_status.lock().unwrap().remove(&key);
    };
    match delay {
        None => finish(),
        Some(delay) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                finish();
            });
        }
    }
}

fn send_reply(reply: WorkerReply, handle: JobHandle, tx: &mpsc::UnboundedSender<Packet>) {
    match reply {
        WorkerReply::Complete(result) => {
            let _ = tx.send(Packet::WorkComplete {
                handle,
                result: result.into(),
            });
        }
        WorkerReply::Chunked(chunks, result) => {
            for chunk in chunks {
                let _ = tx.send(Packet::WorkData {
                    handle: handle.clone(),
                    data: chunk.into(),
                });
            }
            let _ = tx.send(Packet::WorkComplete {
                handle,
                result: result.into(),
            });
        }
        WorkerReply::Progress(numerator, denominator, result) => {
            let _ = tx.send(Packet::WorkStatus {
                handle: handle.clone(),
                numerator,
                denominator,
            });
            let _ = tx.send(Packet::WorkComplete {
                handle,
                result: result.into(),
            });
        }
        WorkerReply::Warn(message, result) => {
            let _ = tx.send(Packet::WorkWarning {
                handle: handle.clone(),
                message: message.into(),
            });
            let _ = tx.send(Packet::WorkComplete {
                handle,
                result: result.into(),
            });
        }
        WorkerReply::Fail => {
            let _ = tx.send(Packet::WorkFail { handle });
        }
        WorkerReply::Exception(payload) => {
            let _ = tx.send(Packet::WorkException {
                handle: handle.clone(),
                payload: payload.into(),
            });
            let _ = tx.send(Packet::WorkFail { handle });
        }
        WorkerReply::Delayed(_, inner) => send_reply(*inner, handle, tx),
    }
}

// ── Smoke tests against the harness itself ────────────────────────────────────

#[tokio::test]
async fn echo_round_trips_every_endpoint() -> Result<()> {
    let a = MockServer::start().await?;
    let b = MockServer::start().await?;
    let mut client = a.client();
    client.add_server("127.0.0.1", b.port);

    client.echo(b"anyone home?").await?;
    Ok(())
}

#[tokio::test]
async fn server_option_accepts_and_rejects() -> Result<()> {
    let server = MockServer::start().await?;
    let mut client = server.client();

    client.server_option("exceptions").await?;

    let err = client.server_option("reject-me").await.unwrap_err();
    match err {
        libcapstan::CapstanError::Server { code, .. } => {
            assert_eq!(code, "ERR_UNKNOWN_OPTION");
        }
        other => panic!("expected a server error, got {other:?}"),
    }
    Ok(())
}
