//! Wire framing of batches, the completion marker and acknowledgments.
//!
//! Every frame is one line: records are joined with [`RECORD_SEPARATOR`] and
//! the whole batch ends with a single [`TERMINATOR`]. Records use the same
//! character between their own fields, so a frame decodes by grouping its
//! fields in runs of [`BET_FIELDS`].

use thiserror::Error;

pub const RECORD_SEPARATOR: char = ';';
pub const FIELD_SEPARATOR: char = ';';
pub const TERMINATOR: u8 = b'\n';
pub const DONE_PREFIX: &str = "DONE:";
pub const BET_FIELDS: usize = 6;

/// Appends the line terminator to a payload, producing one frame.
pub fn terminate(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(TERMINATOR);
    frame
}

/// Completion marker. Sent without a terminator; the server looks for the
/// prefix and takes the rest of the stream as the client id.
pub fn encode_done(client_id: &str) -> Vec<u8> {
    format!("{DONE_PREFIX}{client_id}").into_bytes()
}

/// A batch frame whose field count does not split into whole records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("frame has {fields} fields, not a multiple of {}", BET_FIELDS)]
pub struct DecodeError {
    pub fields: usize,
}

/// Splits a batch frame back into its records, each as its six fields.
///
/// Accepts the frame with or without its terminator.
pub fn decode_batch(frame: &str) -> Result<Vec<Vec<String>>, DecodeError> {
    let body = frame.strip_suffix(TERMINATOR as char).unwrap_or(frame);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let fields: Vec<&str> = body.split(RECORD_SEPARATOR).collect();
    if fields.len() % BET_FIELDS != 0 {
        return Err(DecodeError {
            fields: fields.len(),
        });
    }
    Ok(fields
        .chunks(BET_FIELDS)
        .map(|chunk| chunk.iter().map(|f| (*f).to_owned()).collect())
        .collect())
}

/// Reads the decimal count out of an acknowledgment line.
pub fn parse_ack(line: &str) -> Option<usize> {
    let digits = line.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
