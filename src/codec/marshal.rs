//! Encoding/Decoding zwischen Host-Typen und Wire-Layouts
//!
//! Encoder kopieren Host-Daten in einen [`MarshalFrame`]. Decoder kopieren
//! Foreign-Memory in neue Host-Buffer und lesen niemals über die im Record
//! angegebene Länge hinaus.

use super::arena::MarshalFrame;
use super::layout::{BatchRecord, BlobRecord};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::mem::align_of;
use thiserror::Error;

/// Maximale Anzahl Bytes in Log-Previews
const PREVIEW_BYTES: usize = 24;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Boundary allocation of {requested} bytes failed: {reason}")]
    AllocationFailure { requested: usize, reason: String },

    #[error("Malformed layout: {0}")]
    MalformedLayout(String),
}

// ============================================================================
// OPAQUE BLOB
// ============================================================================

/// Opaker Signaling-Payload (Offer, Answer oder ICE Candidate)
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct OpaqueBlob(Vec<u8>);

impl OpaqueBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for OpaqueBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for OpaqueBlob {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for OpaqueBlob {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for OpaqueBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaqueBlob")
            .field("len", &self.0.len())
            .field("preview", &preview(&self.0))
            .finish()
    }
}

/// Gekürzte Base64-Darstellung für Logs
pub fn preview(bytes: &[u8]) -> String {
    if bytes.len() > PREVIEW_BYTES {
        format!("{}…", BASE64.encode(&bytes[..PREVIEW_BYTES]))
    } else {
        BASE64.encode(bytes)
    }
}

// ============================================================================
// ENCODING
// ============================================================================

/// Kopiert `bytes` in den Frame und beschreibt sie als Blob-Record
pub fn encode_blob(frame: &mut MarshalFrame, bytes: &[u8]) -> Result<BlobRecord, CodecError> {
    let data = frame.alloc_copy(bytes)?;
    Ok(BlobRecord {
        len: bytes.len() as u64,
        data,
    })
}

/// UTF-8 String im Blob-Layout
pub fn encode_text(frame: &mut MarshalFrame, text: &str) -> Result<BlobRecord, CodecError> {
    encode_blob(frame, text.as_bytes())
}

/// Schreibt Count und `rows.len()` Blob-Records an festen Offsets
pub fn encode_blob_batch<R: AsRef<[u8]>>(
    frame: &mut MarshalFrame,
    rows: &[R],
) -> Result<*const BatchRecord, CodecError> {
    let size = BatchRecord::byte_size(rows.len()).ok_or_else(|| CodecError::AllocationFailure {
        requested: usize::MAX,
        reason: format!("batch of {} rows overflows the address space", rows.len()),
    })?;

    let base = frame.alloc_zeroed(size, align_of::<BatchRecord>())?;
    let batch = base.as_ptr() as *mut BatchRecord;

    unsafe {
        std::ptr::addr_of_mut!((*batch).count).write(rows.len() as u64);
    }

    for (index, row) in rows.iter().enumerate() {
        let record = encode_blob(frame, row.as_ref())?;
        unsafe {
            let slot = BatchRecord::row_ptr(batch, index) as *mut BlobRecord;
            slot.write(record);
        }
    }

    Ok(batch as *const BatchRecord)
}

// ============================================================================
// DECODING
// ============================================================================

/// Kopiert genau `len` Bytes ab `data` in einen neuen Host-Buffer
///
/// # Safety
/// Wenn `data` nicht null und `len > 0` ist, muss `data` auf mindestens
/// `len` lesbare Bytes zeigen.
pub unsafe fn decode_raw(data: *const u8, len: u64) -> Result<Vec<u8>, CodecError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if data.is_null() {
        return Err(CodecError::MalformedLayout(format!(
            "null data pointer with length {}",
            len
        )));
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= isize::MAX as usize)
        .ok_or_else(|| CodecError::MalformedLayout(format!("length {} exceeds address space", len)))?;

    Ok(std::slice::from_raw_parts(data, len).to_vec())
}

/// Liest einen Blob-Record
///
/// # Safety
/// Siehe [`decode_raw`].
pub unsafe fn decode_blob(record: &BlobRecord) -> Result<Vec<u8>, CodecError> {
    decode_raw(record.data, record.len)
}

/// Liest einen String-Record und prüft UTF-8
///
/// # Safety
/// Siehe [`decode_raw`].
pub unsafe fn decode_text(record: &BlobRecord) -> Result<String, CodecError> {
    let bytes = decode_blob(record)?;
    String::from_utf8(bytes)
        .map_err(|e| CodecError::MalformedLayout(format!("string record is not UTF-8: {}", e)))
}

/// Liest einen Batch-Record; jede Row wird über ihre eigene Länge dekodiert
///
/// # Safety
/// `batch` muss null sein oder auf einen Batch-Record zeigen, dessen Count
/// mit der Anzahl tatsächlich vorhandener Rows übereinstimmt.
pub unsafe fn decode_blob_batch(batch: *const BatchRecord) -> Result<Vec<Vec<u8>>, CodecError> {
    if batch.is_null() {
        return Err(CodecError::MalformedLayout("null batch pointer".to_string()));
    }

    let count = std::ptr::addr_of!((*batch).count).read_unaligned();
    let count = usize::try_from(count)
        .ok()
        .filter(|count| BatchRecord::byte_size(*count).is_some())
        .ok_or_else(|| CodecError::MalformedLayout(format!("batch count {} too large", count)))?;

    let mut rows = Vec::with_capacity(count.min(1024));
    for index in 0..count {
        let record = BatchRecord::row_ptr(batch, index).read_unaligned();
        let row = decode_blob(&record).map_err(|e| match e {
            CodecError::MalformedLayout(reason) => {
                CodecError::MalformedLayout(format!("row {}: {}", index, reason))
            }
            other => other,
        })?;
        rows.push(row);
    }
    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================
