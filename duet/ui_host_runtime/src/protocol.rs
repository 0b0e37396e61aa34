use crate::handle_table::Handle;
use crate::operation::ElementOperation;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Cursor, Read, Write};
use std::sync::mpsc::Receiver;

pub const BACKGROUND_TO_MAIN_CAP: usize = 1_048_576;
pub const MAIN_TO_BACKGROUND_CAP: usize = 65_536;

/// Envelopes the main thread sends back to the background thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum MainEnvelope {
    #[serde(rename = "ready")]
    Ready { sid: String, capabilities: Value },
    #[serde(rename = "ack")]
    Ack { sid: String, rev: u64 },
    #[serde(rename = "resync")]
    Resync {
        sid: String,
        #[serde(default)]
        last_rev: Option<u64>,
        reason: String,
    },
    #[serde(rename = "event")]
    Event {
        sid: String,
        uid: Handle,
        #[serde(rename = "eventType")]
        event_type: String,
        #[serde(default)]
        bubbles: bool,
        #[serde(default)]
        detail: Value,
    },
}

/// Envelopes the background thread sends to the main thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum BackgroundEnvelope {
    #[serde(rename = "batch")]
    Batch {
        sid: String,
        rev: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
        ops: Vec<ElementOperation>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        worklet_ref_init: Vec<(u32, Value)>,
    },

    /// Drops the replica; the next batch starts from rev 1.
    #[serde(rename = "reset")]
    Reset { sid: String },

    #[serde(rename = "error")]
    Error {
        sid: String,
        #[serde(default)]
        rev: Option<u64>,
        code: String,
        message: String,
    },
}

pub fn ready_envelope(sid: String) -> MainEnvelope {
    MainEnvelope::Ready {
        sid,
        capabilities: serde_json::json!({
            "ops": "element-operation-v1",
            "transport": "stdio-packet-4"
        }),
    }
}

pub fn event_envelope(
    sid: String,
    uid: Handle,
    event_type: impl Into<String>,
    bubbles: bool,
    detail: Value,
) -> MainEnvelope {
    MainEnvelope::Event {
        sid,
        uid,
        event_type: event_type.into(),
        bubbles,
        detail,
    }
}

pub fn writer_loop<W: Write>(writer: &mut W, rx: Receiver<MainEnvelope>) -> io::Result<()> {
    for envelope in rx {
        let payload = encode_json(&envelope)?;
        write_frame(writer, &payload, MAIN_TO_BACKGROUND_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

/// Reads frames until a clean EOF. A frame that fails to decode is handed to
/// `on_envelope` as an error so the caller can request a resync.
pub fn reader_loop<R, F>(reader: &mut R, mut on_envelope: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(io::Result<BackgroundEnvelope>),
{
    loop {
        match read_frame(reader, BACKGROUND_TO_MAIN_CAP) {
            Ok(payload) => on_envelope(decode_json(&payload)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Serializes `value` into one length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T, max_payload: usize) -> io::Result<Vec<u8>> {
    let payload = encode_json(value)?;
    let mut out = Vec::with_capacity(payload.len() + 4);
    write_frame(&mut out, &payload, max_payload)?;
    Ok(out)
}

/// Inverse of [`encode_frame`]. Trailing bytes after the frame are rejected.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8], max_payload: usize) -> io::Result<T> {
    let mut cursor = Cursor::new(frame);
    let payload = read_frame(&mut cursor, max_payload)?;
    if cursor.position() as usize != frame.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "trailing bytes after frame",
        ));
    }
    decode_json(&payload)
}

fn encode_json<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(json_error)
}

fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    serde_json::from_slice(payload).map_err(json_error)
}

fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
