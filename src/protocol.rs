//! Pool ↔ worker wire protocol.
//!
//! Newline-delimited JSON, one frame per line. Every frame carries the
//! protocol version `v` and a `type` tag:
//!
//! ```text
//! {"v":1,"type":"ASSIGN","task_id":"…","payload":{…},"soft_limit":314572800,"max_execution_ms":600000}
//! {"v":1,"type":"PROGRESS","task_id":"…","percent":40,"memory_estimate":52428800}
//! ```

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::ProtocolError;
use crate::task::TaskId;

pub const PROTOCOL_VERSION: u8 = 1;

/// Longest accepted frame, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Pool → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolMessage {
    Assign {
        task_id: TaskId,
        payload: serde_json::Value,
        /// Advisory memory limit in bytes.
        soft_limit: u64,
        max_execution_ms: u64,
        /// Resume point from an earlier preemption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint: Option<serde_json::Value>,
    },
    Preempt {
        reason: String,
        checkpoint_timeout_ms: u64,
    },
    /// Soft limit crossed: release caches and buffers.
    Advise {
        task_id: TaskId,
        memory_estimate: u64,
        soft_limit: u64,
    },
    /// Exit once idle.
    Shutdown,
}

/// Worker → pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    Ready {
        pid: u32,
    },
    Progress {
        task_id: TaskId,
        percent: u8,
        memory_estimate: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint: Option<serde_json::Value>,
    },
    Complete {
        task_id: TaskId,
        result: serde_json::Value,
    },
    Failed {
        task_id: TaskId,
        error: String,
        /// Guarded operation that failed, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guard: Option<String>,
    },
    Preempted {
        task_id: TaskId,
        #[serde(default)]
        checkpoint: Option<serde_json::Value>,
    },
}

#[derive(Serialize)]
struct OutFrame<'a, T> {
    v: u8,
    #[serde(flatten)]
    msg: &'a T,
}

#[derive(Deserialize)]
struct InFrame<T> {
    v: u8,
    #[serde(flatten)]
    msg: T,
}

#[derive(Deserialize)]
struct VersionProbe {
    v: u8,
}

/// Encode one frame (without the trailing newline).
pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&OutFrame {
        v: PROTOCOL_VERSION,
        msg,
    })?)
}

/// Decode one line, checking the version before the body.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let probe: VersionProbe = serde_json::from_str(line)?;
    if probe.v != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: probe.v,
        });
    }
    let frame: InFrame<T> = serde_json::from_str(line)?;
    debug_assert_eq!(frame.v, PROTOCOL_VERSION);
    Ok(frame.msg)
}

fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_LEN)
}

/// Reads typed frames from a byte stream.
pub struct FrameReader<R, T> {
    inner: FramedRead<R, LinesCodec>,
    _msg: std::marker::PhantomData<fn() -> T>,
}

impl<R, T> FrameReader<R, T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    pub fn new(reader: R) -> Self {
        Self {
            inner: FramedRead::new(reader, codec()),
            _msg: std::marker::PhantomData,
        }
    }

    /// Next frame; `Ok(None)` on clean end of stream. Blank lines are skipped.
    pub async fn next(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return decode(&line).map(Some),
            }
        }
    }
}

/// Writes typed frames to a byte stream.
pub struct FrameWriter<W, T> {
    inner: FramedWrite<W, LinesCodec>,
    _msg: std::marker::PhantomData<fn(T)>,
}

impl<W, T> FrameWriter<W, T>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, codec()),
            _msg: std::marker::PhantomData,
        }
    }

    /// Write and flush one frame.
    pub async fn send(&mut self, msg: &T) -> Result<(), ProtocolError> {
        let line = encode(msg)?;
        self.inner.send(line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_wire_shape() {
        let id = TaskId::new();
        let line = encode(&PoolMessage::Assign {
            task_id: id,
            payload: serde_json::json!({"op": "echo"}),
            soft_limit: 300,
            max_execution_ms: 1000,
            checkpoint: None,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["type"], "ASSIGN");
        assert_eq!(value["task_id"], id.to_string());
        assert!(value.get("checkpoint").is_none());
    }

    #[test]
    fn decodes_worker_frames() {
        let id = TaskId::new();
        let line = format!(r#"{{"v":1,"type":"PREEMPTED","task_id":"{id}","checkpoint":{{"step":3}}}}"#);
        let msg: WorkerMessage = decode(&line).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Preempted {
                task_id: id,
                checkpoint: Some(serde_json::json!({"step": 3})),
            }
        );
    }

    #[test]
    fn preempted_without_checkpoint() {
        let id = TaskId::new();
        let line = format!(r#"{{"v":1,"type":"PREEMPTED","task_id":"{id}"}}"#);
        let msg: WorkerMessage = decode(&line).unwrap();
        assert!(matches!(msg, WorkerMessage::Preempted { checkpoint: None, .. }));
    }

    #[test]
    fn rejects_other_versions() {
        let err = decode::<PoolMessage>(r#"{"v":2,"type":"SHUTDOWN"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::VersionMismatch { found: 2, .. }));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(decode::<WorkerMessage>(r#"{"v":1,"type":"LAUNCH"}"#).is_err());
    }

    #[tokio::test]
    async fn frames_cross_a_pipe() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::<_, PoolMessage>::new(a);
        let mut reader = FrameReader::<_, PoolMessage>::new(b);

        writer
            .send(&PoolMessage::Preempt {
                reason: "memory critical".into(),
                checkpoint_timeout_ms: 5000,
            })
            .await
            .unwrap();
        writer.send(&PoolMessage::Shutdown).await.unwrap();
        drop(writer);

        assert!(matches!(reader.next().await.unwrap(), Some(PoolMessage::Preempt { .. })));
        assert_eq!(reader.next().await.unwrap(), Some(PoolMessage::Shutdown));
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_an_error() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let mut reader = FrameReader::<_, WorkerMessage>::new(b);
        tokio::spawn(async move {
            let chunk = vec![b'x'; 16 * 1024];
            for _ in 0..(MAX_FRAME_LEN / chunk.len() + 2) {
                if a.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        assert!(matches!(reader.next().await, Err(ProtocolError::Codec(_))));
    }
}
