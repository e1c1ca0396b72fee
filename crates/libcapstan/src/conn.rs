//! One server endpoint: lazy TCP connection plus its read/write buffers.
//!
//! A `ServerConn` never blocks its caller beyond readiness waits: writes are
//! queued and flushed with `try_write`, reads are drained with `try_read`,
//! and the engine owns the single bounded wait across all endpoints.

use bytes::BytesMut;
use capstan_core::codec::{decode_packet, encode_packet, Decoded};
use capstan_core::packet::Packet;
use tokio::net::{lookup_host, TcpStream};

use crate::error::CapstanError;

pub(crate) struct ServerConn {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    last_error: Option<String>,
}

impl ServerConn {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            last_error: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` label used in errors and logs.
    pub fn addr_label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Connect if not already connected. Called lazily from the first send
    /// after construction or after a failure marked the endpoint dead.
    pub async fn ensure_connected(&mut self) -> Result<(), CapstanError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addrs: Vec<_> = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                self.last_error = Some(e.to_string());
                CapstanError::resolve(&self.host, &e)
            })?
            .collect();

        let mut last_err: Option<std::io::Error> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    // Frames are small; don't let Nagle sit on them.
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(addr = %self.addr_label(), "connected");
                    self.stream = Some(stream);
                    self.last_error = None;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }

        let err = last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
        });
        self.last_error = Some(err.to_string());
        Err(CapstanError::could_not_connect(&self.addr_label(), &err))
    }

    /// Encode a packet onto the write buffer. Bytes move on the next flush.
    pub fn queue_packet(&mut self, packet: &Packet) -> Result<(), CapstanError> {
        let frame = encode_packet(packet)?;
        self.write_buf.extend_from_slice(&frame);
        Ok(())
    }

    /// Push queued bytes to the socket, connecting first if needed.
    /// Partial writes leave the remainder queued for the next call.
    pub async fn flush(&mut self) -> Result<(), CapstanError> {
        self.ensure_connected().await?;

        while !self.write_buf.is_empty() {
            let stream = match self.stream.as_ref() {
                Some(s) => s,
                None => return Err(self.lost()),
            };
            if let Err(e) = stream.writable().await {
                return Err(self.lost_with(&e));
            }
            let stream = match self.stream.as_ref() {
                Some(s) => s,
                None => return Err(self.lost()),
            };
            match stream.try_write(&self.write_buf) {
                Ok(0) => return Err(self.lost()),
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(self.lost_with(&e)),
            }
        }
        Ok(())
    }

    /// Drain at most one packet without waiting. `Ok(None)` means nothing is
    /// ready right now; a decode failure or peer close kills the endpoint.
    pub fn try_recv(&mut self) -> Result<Option<Packet>, CapstanError> {
        loop {
            match decode_packet(&mut self.read_buf) {
                Ok(Decoded::Packet(packet)) => return Ok(Some(packet)),
                Ok(Decoded::Need(_)) => {}
                Err(e) => {
                    self.last_error = Some(e.to_string());
                    self.mark_dead();
                    return Err(CapstanError::Protocol(e));
                }
            }

            let stream = match self.stream.as_ref() {
                Some(s) => s,
                None => return Ok(None),
            };
            let mut chunk = [0u8; 4096];
            match stream.try_read(&mut chunk) {
                Ok(0) => return Err(self.lost()),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(self.lost_with(&e)),
            }
        }
    }

    /// Wait until the socket is readable. Never resolves for a dead
    /// endpoint — the engine only waits on connected ones.
    pub async fn readable(&self) {
        match &self.stream {
            Some(s) => {
                let _ = s.readable().await;
            }
            None => std::future::pending().await,
        }
    }

    pub fn mark_dead(&mut self) {
        self.stream = None;
        self.read_buf.clear();
        self.write_buf.clear();
    }

    fn lost(&mut self) -> CapstanError {
        let addr = self.addr_label();
        self.last_error = Some("connection lost".to_string());
        self.mark_dead();
        tracing::debug!(addr = %addr, "connection lost");
        CapstanError::ConnectionLost { addr }
    }

    fn lost_with(&mut self, err: &std::io::Error) -> CapstanError {
        self.last_error = Some(err.to_string());
        let addr = self.addr_label();
        self.mark_dead();
        tracing::debug!(addr = %addr, error = %err, "connection error");
        CapstanError::ConnectionLost { addr }
    }
}
