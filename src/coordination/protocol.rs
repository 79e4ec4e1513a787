//! Coordination wire protocol
//!
//! The server speaks newline-delimited JSON over TCP: each request is one
//! JSON object on one line, answered by exactly one JSON object on one
//! line. This framing is the public contract for test-side bindings.
//!
//! Requests carry an `op` discriminator:
//!
//! ```text
//! {"op":"acquire_lock","name":"db","caller":"af12..."}
//! {"op":"get_parallel_value","key":"build"}
//! ```
//!
//! Responses carry a `status` discriminator:
//!
//! ```text
//! {"status":"ok"}
//! {"status":"value","value":"server-1"}
//! {"status":"retry"}
//! {"status":"error","kind":"no_value_set_available","message":"..."}
//! ```
//!
//! `retry` means the operation is valid but currently contended; the
//! caller polls until granted. Error kinds are stable identifiers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single operation sent by a caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Announce a caller id; starts liveness tracking.
    Register { caller: String },
    /// Refresh liveness for a caller.
    Ping { caller: String },
    /// Drop a caller: releases its locks, lease and run-once grants.
    Deregister { caller: String },

    AcquireLock { name: String, caller: String },
    ReleaseLock { name: String, caller: String },

    SetParallelValue { key: String, value: String },
    GetParallelValue { key: String },

    AcquireValueSet {
        caller: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    GetValueFromSet { key: String, caller: String },
    ReleaseValueSet { caller: String },
    /// Insert a value set at runtime; a `tags` key in the mapping becomes
    /// the comma-separated tag list.
    AddValueSet {
        name: String,
        values: BTreeMap<String, String>,
    },

    RunOnlyOnce { id: String, caller: String },
    RunOnceComplete {
        id: String,
        caller: String,
        passed: bool,
    },

    /// Orderly server shutdown.
    Stop,
}

/// Stable error identifiers reported to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Every matching value set is currently leased; retry later.
    NoValueSetAvailable,
    /// No value set carries the requested tag at all.
    NoSuchTag,
    /// Operating on a lease or lock the caller does not hold.
    ReleaseWithoutAcquire,
    /// Acquiring a second value set without releasing the first.
    AcquireWithoutRelease,
    /// Leased set has no value under the requested key.
    NoSuchValue,
    /// Releasing a lock held by someone else.
    LockNotHeld,
    /// The run-once body failed in the process that executed it.
    RunOnceFailed,
    /// Request could not be decoded.
    Malformed,
}

/// A single server reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Value { value: String },
    Retry,
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn value(value: impl Into<String>) -> Self {
        Response::Value {
            value: value.into(),
        }
    }
}

/// Encode a protocol message as one line (no trailing newline).
pub fn encode<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).expect("protocol types always serialize")
}

/// Decode a protocol line.
pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = Request::AcquireLock {
            name: "db".to_string(),
            caller: "c1".to_string(),
        };
        let line = encode(&request);
        assert!(line.contains(r#""op":"acquire_lock""#));
        let decoded: Request = decode(&line).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn optional_tag_is_omitted() {
        let request = Request::AcquireValueSet {
            caller: "c1".to_string(),
            tag: None,
        };
        assert!(!encode(&request).contains("tag"));

        let decoded: Request = decode(r#"{"op":"acquire_value_set","caller":"c1"}"#).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_round_trip() {
        let response = Response::error(ErrorKind::NoSuchTag, "no such tag: admin");
        let line = encode(&response);
        assert!(line.contains(r#""kind":"no_such_tag""#));
        let decoded: Response = decode(&line).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn unknown_op_fails_to_decode() {
        assert!(decode::<Request>(r#"{"op":"explode"}"#).is_err());
    }
}
