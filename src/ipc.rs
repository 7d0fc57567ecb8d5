//! One-way typed message channel, worker → host (spec §4.5, Design Notes §9
//! "tagged message union, length-prefixed, not raw dictionaries").
//!
//! Frames are `{len: u32 LE}{json bytes}` over an anonymous pipe. The worker
//! writes frames synchronously (backpressure from a full OS pipe buffer is
//! acceptable per spec §5); the host reads them non-blockingly, draining
//! whatever is available each time it polls.

use crate::log_entry::LogEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use tokio::io::{AsyncRead, ReadBuf};

/// The `state.exception` payload shape (spec §6, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionPayload {
    #[serde(rename = "developer_msg")]
    pub developer_msg: String,
    pub msg: String,
    pub data: Value,
    #[serde(rename = "model_id")]
    pub model_id: String,
}

/// The tagged union of messages a worker may send over the IPC channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Non-terminal progress/message update.
    Update {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },
    /// A batch of structured log entries, in emission order.
    Log { entries: Vec<LogEntry> },
    /// Clean completion: progress is always 1.0; `results` carries any
    /// recorded document-port modifications (and, per the resolved open
    /// question, modified stream/multistream output ports).
    Complete {
        results: HashMap<String, Value>,
    },
    /// User code raised, or the harness could not invoke it at all.
    Fail { exception: ExceptionPayload },
}

/// Write one length-prefixed JSON frame to `w`. Used by the worker-side
/// synchronous IPC writer.
pub fn write_frame<W: Write>(w: &mut W, message: &WorkerMessage) -> io::Result<()> {
    let bytes = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&bytes)?;
    w.flush()
}

/// Read one length-prefixed JSON frame from a blocking reader. Returns
/// `Ok(None)` on clean EOF (writer end closed, e.g. worker exited).
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<WorkerMessage>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(r, &mut len_buf)? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    let message = serde_json::from_slice(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(message))
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(filled == 0),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// A waker that does nothing on wake. Lets us poll an `AsyncRead` exactly
/// once per iteration without ever suspending the calling task — `poll_read`
/// itself performs a non-blocking syscall and returns `Poll::Pending` (not an
/// error) when nothing is ready, so driving it with a real `.await` would
/// park the task instead of returning control to the caller.
fn noop_waker() -> Waker {
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw_waker()) }
}

/// Drain every complete frame currently available on a reader without ever
/// suspending the calling task (spec §4.5 "the host's reader is
/// non-blocking: it drains available messages each time it is polled and
/// leaves the worker writing unimpeded"). Each `poll_read` call either
/// returns data that was already sitting in the OS pipe buffer or
/// `Poll::Pending`, in which case the loop stops rather than awaiting more —
/// there is deliberately no real waker registered, so a caller holding a
/// lock across this call is never blocked by an idle-but-alive worker.
pub async fn drain_available<R: AsyncRead + Unpin>(
    reader: &mut R,
    pending: &mut Vec<u8>,
) -> io::Result<Vec<WorkerMessage>> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut chunk = [0u8; 8192];
    loop {
        let mut buf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut *reader).poll_read(&mut cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len();
                if n == 0 {
                    break;
                }
                pending.extend_from_slice(buf.filled());
            }
            Poll::Ready(Err(e)) => return Err(e),
            Poll::Pending => break,
        }
    }

    let mut messages = Vec::new();
    loop {
        if pending.len() < 4 {
            break;
        }
        let len = u32::from_le_bytes(pending[..4].try_into().unwrap()) as usize;
        if pending.len() < 4 + len {
            break;
        }
        let body = &pending[4..4 + len];
        match serde_json::from_slice::<WorkerMessage>(body) {
            Ok(message) => messages.push(message),
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
        pending.drain(0..4 + len);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let msg = WorkerMessage::Update {
            message: Some("hi".to_string()),
            progress: Some(0.5),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).unwrap().unwrap();
        match read_back {
            WorkerMessage::Update { message, progress } => {
                assert_eq!(message.as_deref(), Some("hi"));
                assert_eq!(progress, Some(0.5));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn multiple_frames_round_trip_in_order() {
        let a = WorkerMessage::Log { entries: vec![] };
        let b = WorkerMessage::Complete { results: HashMap::new() };

        let mut buf = Vec::new();
        write_frame(&mut buf, &a).unwrap();
        write_frame(&mut buf, &b).unwrap();

        let mut cursor = io::Cursor::new(buf);
        let first = read_frame(&mut cursor).unwrap().unwrap();
        let second = read_frame(&mut cursor).unwrap().unwrap();
        assert!(matches!(first, WorkerMessage::Log { .. }));
        assert!(matches!(second, WorkerMessage::Complete { .. }));
    }

    #[test]
    fn empty_stream_yields_none() {
        let mut cursor = io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[tokio::test]
    async fn drain_available_parses_complete_frames_and_buffers_partial() {
        use tokio::io::AsyncWriteExt;

        let a = WorkerMessage::Update { message: None, progress: Some(1.0) };
        let mut full = Vec::new();
        write_frame(&mut full, &a).unwrap();
        // Append a partial second frame (length prefix only, no body yet).
        full.extend_from_slice(&100u32.to_le_bytes());

        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tx.write_all(&full).await.unwrap();
        tx.shutdown().await.unwrap();
        drop(tx);

        let mut pending = Vec::new();
        let messages = drain_available(&mut rx, &mut pending).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(pending.len(), 4); // partial length prefix retained
    }

    #[tokio::test(flavor = "current_thread")]
    async fn drain_available_returns_immediately_when_writer_is_idle() {
        // Regression test for a deadlock: the writer is alive (not dropped,
        // not shut down) and has sent nothing, so a reader that drives a real
        // `.await` on the underlying `poll_read` would suspend here forever.
        // A single-threaded runtime has nothing else to make progress, so
        // this test hanging is exactly the bug this guards against.
        let (_tx, mut rx) = tokio::io::duplex(64);
        let mut pending = Vec::new();
        let messages = drain_available(&mut rx, &mut pending).await.unwrap();
        assert!(messages.is_empty());
        assert!(pending.is_empty());
    }
}
