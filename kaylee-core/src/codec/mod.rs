//! The wire protocol.
//!
//! A message is an ordered list of frames: a command tag frame followed by
//! the command's payload frames. [`Command`] is the closed vocabulary of the
//! protocol; decoding checks both the tag and the payload arity so that
//! handlers can match exhaustively on well-formed commands.
//!
//! Messages published by the coordinator on the control channel are wrapped
//! in an [`Envelope`], which prefixes the frames with the recipient's
//! [`WorkerId`]. Every worker sees every envelope and keeps only its own.
//!
//! Task key frames carry a [`TaskTag`] rather than the bare serialized key, so
//! that results can be attributed to the dispatch attempt that produced them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::common::WorkerId;

pub mod frame;

/// A raw multi-frame message.
pub type Frames = Vec<Bytes>;

const CONNECT: &[u8] = b"connect";
const BYTECODE: &[u8] = b"bytecode";
const MAP: &[u8] = b"map";
const REDUCE: &[u8] = b"reduce";
const MAPDONE: &[u8] = b"mapdone";
const MAPKEYDONE: &[u8] = b"mapkeydone";
const REDUCEDONE: &[u8] = b"reducedone";
const DONE: &[u8] = b"done";

const ATTEMPT_LEN: usize = std::mem::size_of::<u64>();

#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown command tag {0:?}")]
    UnknownCommand(Bytes),

    #[error("`{command}` expects {expected} payload frames, got {got}")]
    Arity {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("message has no frames")]
    Empty,

    #[error("message of {0} frames exceeds the frame limit")]
    TooManyFrames(usize),

    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("worker id is empty or not valid UTF-8")]
    InvalidWorkerId,

    #[error("task tag of {0} bytes is shorter than its attempt prefix")]
    InvalidTaskTag(usize),
}

/// Identifies one dispatch of a task.
///
/// Every dispatch of a key, original or redundant, gets a fresh `attempt`.
/// On the wire the tag is the big-endian attempt number followed by the
/// serialized task key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TaskTag {
    pub attempt: u64,
    pub key: Bytes,
}

impl TaskTag {
    pub fn new(attempt: u64, key: Bytes) -> Self {
        Self { attempt, key }
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ATTEMPT_LEN + self.key.len());
        buf.put_u64(self.attempt);
        buf.put_slice(&self.key);
        buf.freeze()
    }

    pub fn from_frame(mut frame: Bytes) -> Result<Self, CodecError> {
        if frame.len() < ATTEMPT_LEN {
            return Err(CodecError::InvalidTaskTag(frame.len()));
        }
        let attempt = frame.get_u64();
        Ok(Self {
            attempt,
            key: frame,
        })
    }
}

/// A protocol command, decoded.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Command {
    /// Worker registration.
    Connect { worker: WorkerId },
    /// Delivery of the serialized map and reduce function bodies.
    Bytecode { map: Bytes, reduce: Bytes },
    Map { task: TaskTag, value: Bytes },
    /// `values` is the serialized collection of intermediate values.
    Reduce { task: TaskTag, values: Bytes },
    /// One pair emitted by the map task identified by `task`.
    MapDone {
        task: TaskTag,
        key: Bytes,
        value: Bytes,
    },
    /// The map task identified by `task` has flushed all its pairs.
    MapKeyDone { task: TaskTag },
    ReduceDone { task: TaskTag, result: Bytes },
    /// Stop, clean up and exit.
    Done,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Bytecode { .. } => "bytecode",
            Command::Map { .. } => "map",
            Command::Reduce { .. } => "reduce",
            Command::MapDone { .. } => "mapdone",
            Command::MapKeyDone { .. } => "mapkeydone",
            Command::ReduceDone { .. } => "reducedone",
            Command::Done => "done",
        }
    }

    pub fn into_frames(self) -> Frames {
        match self {
            Command::Connect { worker } => vec![tag(CONNECT), worker.to_frame()],
            Command::Bytecode { map, reduce } => vec![tag(BYTECODE), map, reduce],
            Command::Map { task, value } => vec![tag(MAP), task.to_frame(), value],
            Command::Reduce { task, values } => vec![tag(REDUCE), task.to_frame(), values],
            Command::MapDone { task, key, value } => {
                vec![tag(MAPDONE), task.to_frame(), key, value]
            }
            Command::MapKeyDone { task } => vec![tag(MAPKEYDONE), task.to_frame()],
            Command::ReduceDone { task, result } => {
                vec![tag(REDUCEDONE), task.to_frame(), result]
            }
            Command::Done => vec![tag(DONE)],
        }
    }

    pub fn from_frames(frames: Frames) -> Result<Self, CodecError> {
        let mut frames = frames.into_iter();
        let tag = frames.next().ok_or(CodecError::Empty)?;
        let payload: Frames = frames.collect();

        let command = match &tag[..] {
            CONNECT => {
                let [worker] = arity::<1>("connect", payload)?;
                Command::Connect {
                    worker: worker_id(&worker)?,
                }
            }
            BYTECODE => {
                let [map, reduce] = arity::<2>("bytecode", payload)?;
                Command::Bytecode { map, reduce }
            }
            MAP => {
                let [task, value] = arity::<2>("map", payload)?;
                Command::Map {
                    task: TaskTag::from_frame(task)?,
                    value,
                }
            }
            REDUCE => {
                let [task, values] = arity::<2>("reduce", payload)?;
                Command::Reduce {
                    task: TaskTag::from_frame(task)?,
                    values,
                }
            }
            MAPDONE => {
                let [task, key, value] = arity::<3>("mapdone", payload)?;
                Command::MapDone {
                    task: TaskTag::from_frame(task)?,
                    key,
                    value,
                }
            }
            MAPKEYDONE => {
                let [task] = arity::<1>("mapkeydone", payload)?;
                Command::MapKeyDone {
                    task: TaskTag::from_frame(task)?,
                }
            }
            REDUCEDONE => {
                let [task, result] = arity::<2>("reducedone", payload)?;
                Command::ReduceDone {
                    task: TaskTag::from_frame(task)?,
                    result,
                }
            }
            DONE => {
                let [] = arity::<0>("done", payload)?;
                Command::Done
            }
            _ => return Err(CodecError::UnknownCommand(tag.clone())),
        };

        Ok(command)
    }
}

/// A control message addressed to a single worker.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Envelope {
    pub to: WorkerId,
    pub command: Command,
}

impl Envelope {
    pub fn new(to: WorkerId, command: Command) -> Self {
        Self { to, command }
    }

    pub fn into_frames(self) -> Frames {
        let mut frames = Vec::with_capacity(4);
        frames.push(self.to.to_frame());
        frames.extend(self.command.into_frames());
        frames
    }

    pub fn from_frames(mut frames: Frames) -> Result<Self, CodecError> {
        if frames.is_empty() {
            return Err(CodecError::Empty);
        }
        let to = worker_id(&frames.remove(0))?;
        let command = Command::from_frames(frames)?;
        Ok(Self { to, command })
    }
}

fn tag(name: &'static [u8]) -> Bytes {
    Bytes::from_static(name)
}

fn arity<const N: usize>(command: &'static str, payload: Frames) -> Result<[Bytes; N], CodecError> {
    let got = payload.len();
    payload.try_into().map_err(|_| CodecError::Arity {
        command,
        expected: N,
        got,
    })
}

fn worker_id(frame: &[u8]) -> Result<WorkerId, CodecError> {
    match std::str::from_utf8(frame) {
        Ok(id) if !id.is_empty() => Ok(WorkerId::from(id)),
        _ => Err(CodecError::InvalidWorkerId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static [u8]]) -> Frames {
        parts.iter().map(|p| Bytes::from_static(p)).collect()
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Command::from_frames(frames(&[b"mapkeydon"])).unwrap_err();
        assert!(matches!(err, CodecError::UnknownCommand(tag) if &tag[..] == b"mapkeydon"));
    }

    #[test]
    fn arity_is_checked() {
        let err = Command::from_frames(frames(&[b"bytecode", b"only-map"])).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Arity {
                command: "bytecode",
                expected: 2,
                got: 1
            }
        ));

        let err = Command::from_frames(frames(&[b"done", b"extra"])).unwrap_err();
        assert!(matches!(err, CodecError::Arity { expected: 0, got: 1, .. }));
    }

    #[test]
    fn task_tag_prefixes_the_attempt() {
        let tag = TaskTag::new(258, Bytes::from_static(b"key"));
        let frame = tag.to_frame();
        assert_eq!(&frame[..], b"\0\0\0\0\0\0\x01\x02key");
        assert_eq!(TaskTag::from_frame(frame).unwrap(), tag);

        let err = TaskTag::from_frame(Bytes::from_static(b"short")).unwrap_err();
        assert!(matches!(err, CodecError::InvalidTaskTag(5)));
    }

    #[test]
    fn map_done_carries_the_task_tag() {
        let task = TaskTag::new(1, Bytes::from_static(b"\x00"));
        let command = Command::MapDone {
            task: task.clone(),
            key: Bytes::from_static(b"a"),
            value: Bytes::from_static(b"\x01"),
        };
        let frames = command.clone().into_frames();
        assert_eq!(&frames[0][..], MAPDONE);
        assert_eq!(frames[1], task.to_frame());
        assert_eq!(Command::from_frames(frames).unwrap(), command);
    }

    #[test]
    fn envelope_is_addressed() {
        let envelope = Envelope::new(WorkerId::from("w1"), Command::Done);
        let frames = envelope.clone().into_frames();
        assert_eq!(frames, self::frames(&[b"w1", b"done"]));
        assert_eq!(Envelope::from_frames(frames).unwrap(), envelope);

        let err = Envelope::from_frames(self::frames(&[b"", b"done"])).unwrap_err();
        assert!(matches!(err, CodecError::InvalidWorkerId));
    }
}
