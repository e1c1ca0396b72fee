//! Frame codec — encodes [`Packet`]s and resumes decoding across partial
//! reads.
//!
//! Arguments before the last are NUL-delimited; the last argument is sized by
//! the header's body length and may contain arbitrary bytes, NUL included.
//! [`decode_packet`] never fails on a short buffer — it reports exactly how
//! many more bytes it needs so a connection can feed it reads of any size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use zerocopy::byteorder::U32;
use zerocopy::{AsBytes, FromBytes};

use crate::packet::{submit_flavor, JobHandle, Packet};
use crate::wire::{Command, FrameHeader, PacketMagic, WireError, HEADER_SIZE, MAX_BODY_SIZE};

/// Outcome of one decode step.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// One complete frame was consumed from the buffer.
    Packet(Packet),
    /// The buffer is short by at least this many bytes.
    Need(usize),
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Serialize a packet into one self-describing frame.
pub fn encode_packet(packet: &Packet) -> Result<Bytes, WireError> {
    let command = packet.command();
    let args = packet_args(packet);
    debug_assert_eq!(args.len(), command.arg_count());

    let body_size: usize =
        args.iter().map(|a| a.len()).sum::<usize>() + args.len().saturating_sub(1);
    if body_size > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge {
            size: body_size,
            max: MAX_BODY_SIZE,
        });
    }

    let header = FrameHeader {
        magic: packet.magic().bytes(),
        command: U32::new(command.code()),
        body_size: U32::new(body_size as u32),
    };

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body_size);
    frame.put_slice(header.as_bytes());
    for (i, arg) in args.iter().enumerate() {
        frame.put_slice(arg);
        if i + 1 < args.len() {
            frame.put_u8(0);
        }
    }
    Ok(frame.freeze())
}

/// The ordered argument fields of a packet, numeric fields rendered as ASCII
/// decimal the way the protocol expects them.
fn packet_args(packet: &Packet) -> Vec<Bytes> {
    fn num(n: u32) -> Bytes {
        Bytes::from(n.to_string())
    }
    fn flag(b: bool) -> Bytes {
        Bytes::from_static(if b { b"1" } else { b"0" })
    }
    fn handle(h: &JobHandle) -> Bytes {
        Bytes::copy_from_slice(h.as_bytes())
    }

    match packet {
        Packet::SubmitJob {
            function,
            unique,
            workload,
            ..
        } => vec![function.clone(), unique.clone(), workload.clone()],
        Packet::JobCreated { handle: h } => vec![handle(h)],
        Packet::WorkStatus {
            handle: h,
            numerator,
            denominator,
        } => vec![handle(h), num(*numerator), num(*denominator)],
        Packet::WorkData { handle: h, data } => vec![handle(h), data.clone()],
        Packet::WorkWarning { handle: h, message } => vec![handle(h), message.clone()],
        Packet::WorkException { handle: h, payload } => vec![handle(h), payload.clone()],
        Packet::WorkComplete { handle: h, result } => vec![handle(h), result.clone()],
        Packet::WorkFail { handle: h } => vec![handle(h)],
        Packet::GetStatus { handle: h } => vec![handle(h)],
        Packet::StatusRes {
            handle: h,
            is_known,
            is_running,
            numerator,
            denominator,
        } => vec![
            handle(h),
            flag(*is_known),
            flag(*is_running),
            num(*numerator),
            num(*denominator),
        ],
        Packet::EchoReq { payload } => vec![payload.clone()],
        Packet::EchoRes { payload } => vec![payload.clone()],
        Packet::OptionReq { option } => vec![option.clone()],
        Packet::OptionRes { option } => vec![option.clone()],
        Packet::Error { code, message } => vec![code.clone(), message.clone()],
    }
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Decode one frame from the front of `buf`, if a full one is present.
///
/// On `Decoded::Need(n)` nothing is consumed and the caller should read at
/// least `n` more bytes before retrying. A `WireError` poisons the stream:
/// the buffer is left as-is and the connection should be dropped.
pub fn decode_packet(buf: &mut BytesMut) -> Result<Decoded, WireError> {
    if buf.len() < HEADER_SIZE {
        return Ok(Decoded::Need(HEADER_SIZE - buf.len()));
    }

    let header = match FrameHeader::read_from(&buf[..HEADER_SIZE]) {
        Some(h) => h,
        None => return Ok(Decoded::Need(HEADER_SIZE - buf.len())),
    };
    PacketMagic::from_bytes(header.magic)?;
    let command = Command::try_from(header.command.get())?;
    let body_size = header.body_size.get() as usize;
    if body_size > MAX_BODY_SIZE {
        return Err(WireError::BodyTooLarge {
            size: body_size,
            max: MAX_BODY_SIZE,
        });
    }

    let total = HEADER_SIZE + body_size;
    if buf.len() < total {
        return Ok(Decoded::Need(total - buf.len()));
    }

    buf.advance(HEADER_SIZE);
    let body = buf.split_to(body_size).freeze();
    Ok(Decoded::Packet(build_packet(command, body)?))
}

/// Split a body into the command's declared arguments and build the typed
/// packet.
fn build_packet(command: Command, body: Bytes) -> Result<Packet, WireError> {
    let expected = command.arg_count();
    let mut args: Vec<Bytes> = Vec::with_capacity(expected);
    let mut rest = body;

    if expected == 0 {
        if !rest.is_empty() {
            return Err(WireError::ArgumentCount {
                command: command.name(),
                expected,
                got: 1,
            });
        }
    } else {
        for _ in 0..expected - 1 {
            match rest.iter().position(|&b| b == 0) {
                Some(i) => {
                    args.push(rest.split_to(i));
                    rest.advance(1);
                }
                None => {
                    return Err(WireError::ArgumentCount {
                        command: command.name(),
                        expected,
                        got: args.len() + 1,
                    })
                }
            }
        }
        // An embedded NUL where the final argument must be a bare field means
        // the frame carries more arguments than the command declares.
        if !final_arg_is_free_form(command) && rest.contains(&0) {
            return Err(WireError::ArgumentCount {
                command: command.name(),
                expected,
                got: expected + 1,
            });
        }
        args.push(rest);
    }

    let name = command.name();
    let packet = match command {
        Command::SubmitJob
        | Command::SubmitJobBg
        | Command::SubmitJobHigh
        | Command::SubmitJobHighBg
        | Command::SubmitJobLow
        | Command::SubmitJobLowBg => {
            // arg_count guarantees the flavor exists for these commands.
            let (priority, background) =
                submit_flavor(command).ok_or(WireError::UnexpectedCommand { command: name })?;
            Packet::SubmitJob {
                function: args[0].clone(),
                unique: args[1].clone(),
                workload: args[2].clone(),
                priority,
                background,
            }
        }
        Command::JobCreated => Packet::JobCreated {
            handle: JobHandle::new(args[0].clone()),
        },
        Command::WorkStatus => Packet::WorkStatus {
            handle: JobHandle::new(args[0].clone()),
            numerator: ascii_u32(&args[1], name, "numerator")?,
            denominator: ascii_u32(&args[2], name, "denominator")?,
        },
        Command::WorkData => Packet::WorkData {
            handle: JobHandle::new(args[0].clone()),
            data: args[1].clone(),
        },
        Command::WorkWarning => Packet::WorkWarning {
            handle: JobHandle::new(args[0].clone()),
            message: args[1].clone(),
        },
        Command::WorkException => Packet::WorkException {
            handle: JobHandle::new(args[0].clone()),
            payload: args[1].clone(),
        },
        Command::WorkComplete => Packet::WorkComplete {
            handle: JobHandle::new(args[0].clone()),
            result: args[1].clone(),
        },
        Command::WorkFail => Packet::WorkFail {
            handle: JobHandle::new(args[0].clone()),
        },
        Command::GetStatus => Packet::GetStatus {
            handle: JobHandle::new(args[0].clone()),
        },
        Command::StatusRes => Packet::StatusRes {
            handle: JobHandle::new(args[0].clone()),
            is_known: ascii_flag(&args[1], name, "is_known")?,
            is_running: ascii_flag(&args[2], name, "is_running")?,
            numerator: ascii_u32(&args[3], name, "numerator")?,
            denominator: ascii_u32(&args[4], name, "denominator")?,
        },
        Command::EchoReq => Packet::EchoReq {
            payload: args[0].clone(),
        },
        Command::EchoRes => Packet::EchoRes {
            payload: args[0].clone(),
        },
        Command::OptionReq => Packet::OptionReq {
            option: args[0].clone(),
        },
        Command::OptionRes => Packet::OptionRes {
            option: args[0].clone(),
        },
        Command::Error => Packet::Error {
            code: args[0].clone(),
            message: args[1].clone(),
        },
        // Worker-side traffic. Well-formed protocol, wrong direction.
        other => {
            return Err(WireError::UnexpectedCommand {
                command: other.name(),
            })
        }
    };
    Ok(packet)
}

/// True when the command's final argument is opaque payload bytes that may
/// legitimately contain NUL.
fn final_arg_is_free_form(command: Command) -> bool {
    use Command::*;
    matches!(
        command,
        SubmitJob
            | SubmitJobBg
            | SubmitJobHigh
            | SubmitJobHighBg
            | SubmitJobLow
            | SubmitJobLowBg
            | WorkData
            | WorkWarning
            | WorkException
            | WorkComplete
            | EchoReq
            | EchoRes
            | Error
            | JobAssign
            | JobAssignUniq
            | SubmitJobSched
            | SubmitJobEpoch
    )
}

fn ascii_u32(raw: &[u8], command: &'static str, field: &'static str) -> Result<u32, WireError> {
    // Servers send an empty field where they would send zero.
    if raw.is_empty() {
        return Ok(0);
    }
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(WireError::BadNumericField { command, field })
}

fn ascii_flag(raw: &[u8], command: &'static str, field: &'static str) -> Result<bool, WireError> {
    match raw {
        b"" | b"0" => Ok(false),
        b"1" => Ok(true),
        _ => Err(WireError::BadNumericField { command, field }),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
