//! Capstan wire format — on-wire framing for the job-queue protocol.
//!
//! These types ARE the protocol. Every frame starts with a 12-byte header:
//! 4 magic bytes, a 4-byte big-endian command code, and a 4-byte big-endian
//! body size. The command code fixes how many arguments the body carries.
//! Changing anything here is a breaking change against every deployed
//! job-queue server.
//!
//! The header is #[repr(C)] with zerocopy derives for safe, allocation-free
//! serialization. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// The fixed prefix of every frame in either direction.
///
/// A receiver can size and route a frame before reading a single byte of
/// body. Multi-byte fields are big-endian on the wire.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// `\0REQ` for requests, `\0RES` for responses. Anything else is a
    /// protocol error and poisons the connection.
    pub magic: [u8; 4],

    /// Command code. See [`Command`] for the full table.
    pub command: U32<NetworkEndian>,

    /// Length of the body in bytes, not including this header.
    pub body_size: U32<NetworkEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 12]);

/// Size of [`FrameHeader`] on the wire.
pub const HEADER_SIZE: usize = 12;

/// Request magic bytes.
pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";

/// Response magic bytes.
pub const RES_MAGIC: [u8; 4] = *b"\0RES";

// ── Magic ────────────────────────────────────────────────────────────────────

/// Frame direction, recovered from the magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketMagic {
    Request,
    Response,
}

impl PacketMagic {
    pub fn bytes(self) -> [u8; 4] {
        match self {
            PacketMagic::Request => REQ_MAGIC,
            PacketMagic::Response => RES_MAGIC,
        }
    }

    pub fn from_bytes(raw: [u8; 4]) -> Result<Self, WireError> {
        match raw {
            REQ_MAGIC => Ok(PacketMagic::Request),
            RES_MAGIC => Ok(PacketMagic::Response),
            other => Err(WireError::BadMagic(other)),
        }
    }
}

// ── Command Table ────────────────────────────────────────────────────────────

/// Every command code the protocol defines, client- and worker-side.
///
/// The client core only ever builds a subset of these, but the table is the
/// protocol contract: each code carries a fixed argument count that the codec
/// enforces in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    SetClientId = 22,
    CanDoTimeout = 23,
    AllYours = 24,
    WorkException = 25,
    OptionReq = 26,
    OptionRes = 27,
    WorkData = 28,
    WorkWarning = 29,
    GrabJobUniq = 30,
    JobAssignUniq = 31,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
    SubmitJobSched = 35,
    SubmitJobEpoch = 36,
}

impl Command {
    /// Wire code for this command.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Number of arguments the body must carry. All but the final argument
    /// are NUL-terminated; the final one runs to the end of the body.
    pub fn arg_count(self) -> usize {
        use Command::*;
        match self {
            ResetAbilities | PreSleep | Noop | GrabJob | NoJob | AllYours | GrabJobUniq => 0,
            CanDo | CantDo | JobCreated | WorkFail | GetStatus | EchoReq | EchoRes
            | SetClientId | OptionReq | OptionRes => 1,
            CanDoTimeout | WorkComplete | WorkException | WorkData | WorkWarning | Error => 2,
            SubmitJob | SubmitJobBg | SubmitJobHigh | SubmitJobHighBg | SubmitJobLow
            | SubmitJobLowBg | JobAssign | WorkStatus => 3,
            JobAssignUniq | SubmitJobEpoch => 4,
            StatusRes => 5,
            SubmitJobSched => 8,
        }
    }

    /// Static protocol name, as it appears in server logs.
    pub fn name(self) -> &'static str {
        use Command::*;
        match self {
            CanDo => "CAN_DO",
            CantDo => "CANT_DO",
            ResetAbilities => "RESET_ABILITIES",
            PreSleep => "PRE_SLEEP",
            Noop => "NOOP",
            SubmitJob => "SUBMIT_JOB",
            JobCreated => "JOB_CREATED",
            GrabJob => "GRAB_JOB",
            NoJob => "NO_JOB",
            JobAssign => "JOB_ASSIGN",
            WorkStatus => "WORK_STATUS",
            WorkComplete => "WORK_COMPLETE",
            WorkFail => "WORK_FAIL",
            GetStatus => "GET_STATUS",
            EchoReq => "ECHO_REQ",
            EchoRes => "ECHO_RES",
            SubmitJobBg => "SUBMIT_JOB_BG",
            Error => "ERROR",
            StatusRes => "STATUS_RES",
            SubmitJobHigh => "SUBMIT_JOB_HIGH",
            SetClientId => "SET_CLIENT_ID",
            CanDoTimeout => "CAN_DO_TIMEOUT",
            AllYours => "ALL_YOURS",
            WorkException => "WORK_EXCEPTION",
            OptionReq => "OPTION_REQ",
            OptionRes => "OPTION_RES",
            WorkData => "WORK_DATA",
            WorkWarning => "WORK_WARNING",
            GrabJobUniq => "GRAB_JOB_UNIQ",
            JobAssignUniq => "JOB_ASSIGN_UNIQ",
            SubmitJobHighBg => "SUBMIT_JOB_HIGH_BG",
            SubmitJobLow => "SUBMIT_JOB_LOW",
            SubmitJobLowBg => "SUBMIT_JOB_LOW_BG",
            SubmitJobSched => "SUBMIT_JOB_SCHED",
            SubmitJobEpoch => "SUBMIT_JOB_EPOCH",
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = WireError;

    fn try_from(code: u32) -> Result<Self, WireError> {
        use Command::*;
        Ok(match code {
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            22 => SetClientId,
            23 => CanDoTimeout,
            24 => AllYours,
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            30 => GrabJobUniq,
            31 => JobAssignUniq,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            35 => SubmitJobSched,
            36 => SubmitJobEpoch,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Default job-queue server port.
pub const DEFAULT_PORT: u16 = 4730;

/// Maximum body size the codec will encode or accept.
/// A declared size beyond this is treated as a corrupt header.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Maximum client-supplied unique id length. Longer uniques are rejected
/// before anything touches the wire.
pub const MAX_UNIQUE_SIZE: usize = 64;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when framing or interpreting wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unknown command code: {0}")]
    UnknownCommand(u32),

    #[error("{command} frame not valid on a client connection")]
    UnexpectedCommand { command: &'static str },

    #[error("declared body size {size} exceeds maximum {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("{command} carries {got} argument(s), expected {expected}")]
    ArgumentCount {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{command} field `{field}` is not a decimal number")]
    BadNumericField {
        command: &'static str,
        field: &'static str,
    },
}

// ── Tests ────────────────────────────────────────────────────────────────────
