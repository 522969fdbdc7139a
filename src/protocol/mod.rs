//! # Binary Wire Protocol
//!
//! Every request and response is one frame: a 1-byte type (opcode for
//! requests, status for responses), a 4-byte big-endian payload length,
//! and the payload. The frame layout and the per-opcode payload schemas
//! are a bit-exact external contract.

use thiserror::Error;

pub mod codec;

/// Frame header length: 1 type byte + 4 length bytes.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single frame's payload, enforced before the payload
/// is read.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Sentinel length marking an absent value in a multi-value payload.
pub const ABSENT_VALUE_LEN: u32 = 0xFFFF_FFFF;

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload bytes did not match the declared schema
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Request type byte outside the opcode table
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// Response type byte outside the status table
    #[error("unknown status: {0:#04x}")]
    UnknownStatus(u8),

    /// Declared payload length above [`MAX_FRAME_LEN`]
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),
}

/// Result type for codec operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Write one key
    Set = 0x01,
    /// Read one key
    Get = 0x02,
    /// Remove one key
    Delete = 0x03,
    /// Key presence check
    Exists = 0x04,
    /// Increment a counter
    Incr = 0x05,
    /// Decrement a counter
    Decr = 0x06,
    /// Write many keys
    SetMany = 0x10,
    /// Read many keys
    GetMany = 0x11,
    /// Remove many keys
    DeleteMany = 0x12,
    /// Append to a queue
    QueuePush = 0x20,
    /// Take the queue head
    QueuePop = 0x21,
    /// Read the queue head
    QueuePeek = 0x22,
    /// Queue length
    QueueLen = 0x23,
    /// Drop all queue items
    QueueClear = 0x24,
}

impl Opcode {
    /// Decode an opcode byte.
    pub fn from_u8(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0x01 => Ok(Opcode::Set),
            0x02 => Ok(Opcode::Get),
            0x03 => Ok(Opcode::Delete),
            0x04 => Ok(Opcode::Exists),
            0x05 => Ok(Opcode::Incr),
            0x06 => Ok(Opcode::Decr),
            0x10 => Ok(Opcode::SetMany),
            0x11 => Ok(Opcode::GetMany),
            0x12 => Ok(Opcode::DeleteMany),
            0x20 => Ok(Opcode::QueuePush),
            0x21 => Ok(Opcode::QueuePop),
            0x22 => Ok(Opcode::QueuePeek),
            0x23 => Ok(Opcode::QueueLen),
            0x24 => Ok(Opcode::QueueClear),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    /// True for opcodes executed inline on the connection's reader task.
    pub fn is_fast_path(self) -> bool {
        matches!(
            self,
            Opcode::Get | Opcode::Exists | Opcode::Incr | Opcode::Decr
        )
    }
}

/// Response statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Success
    Ok = 0x00,
    /// Failure; payload is a UTF-8 diagnostic
    Error = 0x01,
    /// Missing key or empty queue
    NotFound = 0x02,
    /// Multi-value payload follows
    Multi = 0x03,
}

impl Status {
    /// Decode a status byte.
    pub fn from_u8(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::Error),
            0x02 => Ok(Status::NotFound),
            0x03 => Ok(Status::Multi),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Write one key
    Set {
        /// Key bytes
        key: Vec<u8>,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Read one key
    Get {
        /// Key bytes
        key: Vec<u8>,
    },
    /// Remove one key
    Delete {
        /// Key bytes
        key: Vec<u8>,
    },
    /// Key presence check
    Exists {
        /// Key bytes
        key: Vec<u8>,
    },
    /// Increment a counter key
    Incr {
        /// Key bytes
        key: Vec<u8>,
    },
    /// Decrement a counter key
    Decr {
        /// Key bytes
        key: Vec<u8>,
    },
    /// Write many pairs
    SetMany {
        /// Key/value pairs in wire order
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    },
    /// Read many keys
    GetMany {
        /// Keys in wire order
        keys: Vec<Vec<u8>>,
    },
    /// Remove many keys
    DeleteMany {
        /// Keys in wire order
        keys: Vec<Vec<u8>>,
    },
    /// Append a value to a named queue
    QueuePush {
        /// Queue name
        name: String,
        /// Value bytes
        value: Vec<u8>,
    },
    /// Take the head of a named queue
    QueuePop {
        /// Queue name
        name: String,
    },
    /// Read the head of a named queue
    QueuePeek {
        /// Queue name
        name: String,
    },
    /// Length of a named queue
    QueueLen {
        /// Queue name
        name: String,
    },
    /// Remove all items from a named queue
    QueueClear {
        /// Queue name
        name: String,
    },
}

impl Request {
    /// Opcode this request encodes to.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Set { .. } => Opcode::Set,
            Request::Get { .. } => Opcode::Get,
            Request::Delete { .. } => Opcode::Delete,
            Request::Exists { .. } => Opcode::Exists,
            Request::Incr { .. } => Opcode::Incr,
            Request::Decr { .. } => Opcode::Decr,
            Request::SetMany { .. } => Opcode::SetMany,
            Request::GetMany { .. } => Opcode::GetMany,
            Request::DeleteMany { .. } => Opcode::DeleteMany,
            Request::QueuePush { .. } => Opcode::QueuePush,
            Request::QueuePop { .. } => Opcode::QueuePop,
            Request::QueuePeek { .. } => Opcode::QueuePeek,
            Request::QueueLen { .. } => Opcode::QueueLen,
            Request::QueueClear { .. } => Opcode::QueueClear,
        }
    }

    /// True when this request is handled inline on the reader task.
    pub fn is_fast_path(&self) -> bool {
        self.opcode().is_fast_path()
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Success with a (possibly empty) payload
    Ok(Vec<u8>),
    /// Missing key or empty queue
    NotFound,
    /// Failure with a diagnostic message
    Error(String),
    /// Multi-value result; `None` marks an absent key
    Multi(Vec<Option<Vec<u8>>>),
}

impl Response {
    /// Status byte this response encodes to.
    pub fn status(&self) -> Status {
        match self {
            Response::Ok(_) => Status::Ok,
            Response::NotFound => Status::NotFound,
            Response::Error(_) => Status::Error,
            Response::Multi(_) => Status::Multi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_bytes_match_contract() {
        assert_eq!(Opcode::Set as u8, 0x01);
        assert_eq!(Opcode::Get as u8, 0x02);
        assert_eq!(Opcode::Delete as u8, 0x03);
        assert_eq!(Opcode::Exists as u8, 0x04);
        assert_eq!(Opcode::Incr as u8, 0x05);
        assert_eq!(Opcode::Decr as u8, 0x06);
        assert_eq!(Opcode::SetMany as u8, 0x10);
        assert_eq!(Opcode::GetMany as u8, 0x11);
        assert_eq!(Opcode::DeleteMany as u8, 0x12);
        assert_eq!(Opcode::QueuePush as u8, 0x20);
        assert_eq!(Opcode::QueuePop as u8, 0x21);
        assert_eq!(Opcode::QueuePeek as u8, 0x22);
        assert_eq!(Opcode::QueueLen as u8, 0x23);
        assert_eq!(Opcode::QueueClear as u8, 0x24);
    }

    #[test]
    fn test_status_bytes_match_contract() {
        assert_eq!(Status::Ok as u8, 0x00);
        assert_eq!(Status::Error as u8, 0x01);
        assert_eq!(Status::NotFound as u8, 0x02);
        assert_eq!(Status::Multi as u8, 0x03);
    }

    #[test]
    fn test_fast_path_set() {
        assert!(Opcode::Get.is_fast_path());
        assert!(Opcode::Exists.is_fast_path());
        assert!(Opcode::Incr.is_fast_path());
        assert!(Opcode::Decr.is_fast_path());
        assert!(!Opcode::Set.is_fast_path());
        assert!(!Opcode::Delete.is_fast_path());
        assert!(!Opcode::GetMany.is_fast_path());
        assert!(!Opcode::QueuePop.is_fast_path());
    }

    #[test]
    fn test_unknown_bytes_rejected() {
        assert!(matches!(
            Opcode::from_u8(0x7f),
            Err(ProtocolError::UnknownOpcode(0x7f))
        ));
        assert!(matches!(
            Status::from_u8(0x42),
            Err(ProtocolError::UnknownStatus(0x42))
        ));
    }
}
