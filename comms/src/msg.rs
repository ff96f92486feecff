//! The application layer message set.

use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const ERR_H: Header = 0;
const CONTROL_H: Header = 1;
const REPLY_H: Header = 2;
const GRAD_H: Header = 3;
const WEIGHTS_H: Header = 4;

/// Identifier of a control-plane variable hosted on a parameter server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarId {
    GlobalStep,
    Reading,
    Position,
    ValidatedStep,
    ValidationLoss,
    LearningRateFact,
    ShouldTerminate,
    /// Derived from the schedule and the factor; read-only.
    LearningRate,
}

/// A control-plane variable value.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarValue {
    Int(i64),
    Float(f32),
    Bool(bool),
}

impl VarValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            VarValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            VarValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VarValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Snapshot of the persistent control-plane variables, as stored in
/// checkpoints and restored by the chief on session start.
///
/// The reader flag and the terminate flag are transient and deliberately not
/// part of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ControlSnapshot {
    pub global_step: i64,
    pub position: i64,
    pub validated_step: i64,
    pub validation_loss: f32,
    pub learning_rate_fact: f32,
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Worker handshake carrying its task index, for observability.
    Attach { task_index: usize },

    /// Chief only: install the decay horizon before any step applies.
    Configure { num_steps: i64 },

    /// Chief only: overwrite the control variables from a checkpoint.
    RestoreState(ControlSnapshot),

    ReadVar(VarId),
    WriteVar(VarId, VarValue),

    /// One-round-trip read of everything the step loop polls.
    ReadLoopState,

    /// Atomic read of the persistent control variables, for checkpoints.
    SnapshotState,

    /// Compare-and-set acquisition of the reader flag.
    AcquireReader,
    ReleaseReader,

    /// Assign `validated_step <- global_step`, read atomically server-side.
    MarkValidated,
    HalveLearningRateFact,

    /// Raise the global cooperative stop flag.
    Terminate,

    /// Chief only: seed the token queue for the first synchronous step.
    InitTokens,
    /// Block until a contribution token is available.
    AcquireToken,
    /// Chief queue runner: enter the applied-step event stream.
    SubscribeApplied,
    /// Chief queue runner: release the tokens for the next step.
    RefillTokens,

    /// Pull this server's weight shard.
    PullWeights,

    /// Enqueue one token in this server's done queue.
    Done,
}

/// Replies sent by a parameter server.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Value(VarValue),
    State(ControlSnapshot),
    LoopState {
        global_step: i64,
        validated_step: i64,
        should_terminate: bool,
    },
    /// Outcome of a reader compare-and-set.
    Acquired(bool),
    /// A contribution token grant.
    Token,
    /// Acknowledgement of a gradient contribution, with the learning rate
    /// the shard optimizer uses for the step it belongs to.
    Pushed { learning_rate: f32 },
    /// An applied-step event on the queue-runner channel.
    Applied { global_step: i64 },
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    /// A clipped gradient chunk for the receiving server's shard.
    Gradient(&'a [f32]),
    /// A weight chunk for the receiving server's shard.
    Weights(&'a [f32]),
}

/// The application layer message for the entire system.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Reply(Reply),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    fn frame_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received a frame of {size} bytes, the header alone is {HEADER_SIZE}"),
        ))
    }

    fn invalid_header<T>(header: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("received an invalid message header {header}"),
        ))
    }

    fn encode_error<T>(e: serde_json::Error) -> io::Result<T> {
        Err(io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(detail) => {
                buf.extend_from_slice(&ERR_H.to_be_bytes());
                Some(detail.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_H.to_be_bytes());

                // Command is a derived Serialize over plain enums, encoding
                // into a Vec cannot fail.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Reply(reply) => {
                buf.extend_from_slice(&REPLY_H.to_be_bytes());
                serde_json::to_writer(buf, reply).unwrap();
                None
            }
            Msg::Data(payload) => {
                let (header, nums) = match payload {
                    Payload::Gradient(grad) => (GRAD_H, *grad),
                    Payload::Weights(weights) => (WEIGHTS_H, *weights),
                };

                buf.extend_from_slice(&header.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::frame_is_too_small(buf.len());
        }

        let (head, body) = buf.split_at_mut(HEADER_SIZE);
        let header = Header::from_be_bytes(head.try_into().unwrap());

        match header {
            ERR_H => match std::str::from_utf8(body) {
                Ok(detail) => Ok(Msg::Err(Cow::Borrowed(detail))),
                Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            },
            CONTROL_H => match serde_json::from_slice(body) {
                Ok(cmd) => Ok(Msg::Control(cmd)),
                Err(e) => Self::encode_error(e),
            },
            REPLY_H => match serde_json::from_slice(body) {
                Ok(reply) => Ok(Msg::Reply(reply)),
                Err(e) => Self::encode_error(e),
            },
            GRAD_H | WEIGHTS_H => {
                // The body starts right after the 4-byte header of a 4-byte
                // aligned frame, so the cast cannot fail on alignment.
                let nums = bytemuck::try_cast_slice(body)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))?;

                let payload = match header {
                    GRAD_H => Payload::Gradient(nums),
                    _ => Payload::Weights(nums),
                };

                Ok(Msg::Data(payload))
            }
            other => Self::invalid_header(other),
        }
    }
}
