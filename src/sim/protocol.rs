use std::io::{Read, Write};

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, error, span, trace, Level};

/// Protocol version exchanged in the hello handshake.
pub const PROTOCOL_VERSION: u64 = 1;

/// Upper bound for a single framed message or sensor blob.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Writes one message: a 4-byte big-endian length prefix followed by the
/// JSON document encoded as UTF-8.
pub fn write_message<W: Write>(writer: &mut W, message: &Value) -> Result<()> {
    let span = span!(Level::TRACE, "protocol::write_message");
    let _enter = span.enter();

    let payload = serde_json::to_vec(message).map_err(|e| {
        error!("Failed to encode message: {e}");
        e
    })?;
    if payload.len() > MAX_FRAME_BYTES {
        error!("Outgoing message of {} bytes exceeds limit", payload.len());
        return Err(anyhow!("Message of {} bytes exceeds limit", payload.len()));
    }

    trace!("Writing message of {} bytes", payload.len());
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .map_err(|e| {
            error!("Failed to write length prefix: {e}");
            e
        })?;
    writer.write_all(&payload).map_err(|e| {
        error!("Failed to write message payload: {e}");
        e
    })?;
    writer.flush().map_err(|e| {
        error!("Failed to flush message: {e}");
        e
    })?;

    Ok(())
}

/// Reads one length-prefixed JSON message.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Value> {
    let span = span!(Level::TRACE, "protocol::read_message");
    let _enter = span.enter();

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).map_err(|e| {
        error!("Failed to read length prefix: {e}");
        e
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_BYTES {
        error!("Incoming message of {len} bytes exceeds limit");
        return Err(anyhow!("Message of {len} bytes exceeds limit"));
    }

    trace!("Reading message of {len} bytes");
    let payload = read_blob(reader, len)?;
    let message: Value = serde_json::from_slice(&payload).map_err(|e| {
        error!("Failed to decode message: {e}");
        e
    })?;

    debug!("Received message: {message}");
    Ok(message)
}

/// Reads exactly `len` raw bytes, used for sensor payloads that follow a
/// JSON header.
pub fn read_blob<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let span = span!(Level::TRACE, "protocol::read_blob");
    let _enter = span.enter();

    if len > MAX_FRAME_BYTES {
        error!("Blob of {len} bytes exceeds limit");
        return Err(anyhow!("Blob of {len} bytes exceeds limit"));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).map_err(|e| {
        error!("Failed to read blob of {len} bytes: {e}");
        e
    })?;

    trace!("Read blob of {len} bytes");
    Ok(buffer)
}

/// Checks the `result` field of a response and surfaces the simulator's
/// error message on failure.
pub fn expect_ok(response: &Value, command: &str) -> Result<()> {
    match response.get("result").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        Some("error") => {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            error!("Simulator rejected command {command}: {message}");
            Err(anyhow!("Simulator rejected command {command}: {message}"))
        }
        _ => {
            error!("Malformed response to command {command}: {response}");
            Err(anyhow!("Malformed response to command {command}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_round_trip() -> Result<()> {
        let message = json!({
            "cmd": "load_scenario",
            "map": "west_coast_usa",
            "vehicles": [{"id": "ego_vehicle"}],
        });

        let mut buffer = Vec::new();
        write_message(&mut buffer, &message)?;

        let decoded = read_message(&mut Cursor::new(buffer))?;
        assert_eq!(decoded, message);

        Ok(())
    }

    #[test]
    fn test_length_prefix_is_big_endian() -> Result<()> {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &json!({"cmd": "hello"}))?;

        let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        assert_eq!(len, buffer.len() - 4);

        Ok(())
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(u32::MAX).to_be_bytes());
        buffer.extend_from_slice(b"{}");

        assert!(read_message(&mut Cursor::new(buffer)).is_err());
    }

    #[test]
    fn test_truncated_message_rejected() -> Result<()> {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &json!({"cmd": "hello"}))?;
        buffer.truncate(buffer.len() - 1);

        assert!(read_message(&mut Cursor::new(buffer)).is_err());

        Ok(())
    }

    #[test]
    fn test_blob_round_trip() -> Result<()> {
        let blob: Vec<u8> = (0..=255).collect();
        let read = read_blob(&mut Cursor::new(blob.clone()), blob.len())?;
        assert_eq!(read, blob);

        Ok(())
    }

    #[test]
    fn test_short_blob_rejected() {
        let blob = vec![0u8; 16];
        assert!(read_blob(&mut Cursor::new(blob), 17).is_err());
    }

    #[test]
    fn test_expect_ok_passes_ok() {
        assert!(expect_ok(&json!({"result": "ok"}), "hello").is_ok());
    }

    #[test]
    fn test_expect_ok_surfaces_error_message() {
        let response = json!({"result": "error", "message": "unknown map"});
        let err = expect_ok(&response, "load_scenario").unwrap_err();
        assert!(err.to_string().contains("unknown map"));
    }

    #[test]
    fn test_expect_ok_rejects_malformed_response() {
        assert!(expect_ok(&json!({"status": 200}), "hello").is_err());
    }
}
