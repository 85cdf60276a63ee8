//! Wire-Layouts für die Foreign-Call-Grenze
//!
//! Alle Records sind `#[repr(C)]` und werden byte-genau so an die native
//! Engine übergeben. Größen, Offsets und der Row-Stride werden zur
//! Compile-Zeit geprüft.

use std::mem::{align_of, offset_of, size_of};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("call-bridge wire layouts require a 64-bit target");

// ============================================================================
// CONSTANTS
// ============================================================================

/// Größe eines Blob-Records (length + pointer)
pub const BLOB_RECORD_SIZE: usize = 16;

/// Abstand zweier Rows in einem Batch-Record
pub const BATCH_ROW_STRIDE: usize = BLOB_RECORD_SIZE;

/// Offset der ersten Row hinter dem Count-Feld
pub const BATCH_ROWS_OFFSET: usize = 8;

/// Größe des Video-Frame-Payloads
pub const VIDEO_FRAME_RECORD_SIZE: usize = 24;

// ============================================================================
// RECORDS
// ============================================================================

/// Length-prefixed Byte-Buffer: `{ length: u64, data: pointer }`
///
/// Wird auch für UTF-8 Strings verwendet.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlobRecord {
    pub len: u64,
    pub data: *const u8,
}

impl BlobRecord {
    /// Leerer Record (null pointer, Länge 0)
    pub const fn empty() -> Self {
        Self {
            len: 0,
            data: std::ptr::null(),
        }
    }
}

/// Header eines Batch-Records: `{ count: u64, rows: [BlobRecord; count] }`
///
/// `rows` ist ein Flexible Array Member; die Rows liegen direkt hinter dem
/// Count und werden ausschließlich über `index * BATCH_ROW_STRIDE`
/// adressiert.
#[repr(C)]
#[derive(Debug)]
pub struct BatchRecord {
    pub count: u64,
    pub rows: [BlobRecord; 0],
}

impl BatchRecord {
    /// Gesamtgröße eines Batch-Records mit `count` Rows
    pub fn byte_size(count: usize) -> Option<usize> {
        count
            .checked_mul(BATCH_ROW_STRIDE)
            .and_then(|rows| rows.checked_add(BATCH_ROWS_OFFSET))
    }

    /// Adresse der Row `index` relativ zum Record-Anfang
    ///
    /// # Safety
    /// `base` muss auf einen Batch-Record mit mindestens `index + 1` Rows
    /// zeigen.
    pub unsafe fn row_ptr(base: *const BatchRecord, index: usize) -> *const BlobRecord {
        (base as *const u8).add(BATCH_ROWS_OFFSET + index * BATCH_ROW_STRIDE) as *const BlobRecord
    }
}

/// Payload des Video-Frame-Callbacks
///
/// Enthält kein Length-Prefix: `byte_size` ist die einzige gültige Grenze.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VideoFrameRecord {
    pub data: *const u8,
    pub width: i32,
    pub height: i32,
    pub byte_size: u64,
}

// ============================================================================
// LAYOUT ASSERTIONS
// ============================================================================

const _: () = {
    assert!(size_of::<BlobRecord>() == BLOB_RECORD_SIZE);
    assert!(offset_of!(BlobRecord, len) == 0);
    assert!(offset_of!(BlobRecord, data) == 8);
    assert!(size_of::<BlobRecord>() == BATCH_ROW_STRIDE);
    assert!(offset_of!(BatchRecord, rows) == BATCH_ROWS_OFFSET);
    assert!(align_of::<BatchRecord>() == 8);
    assert!(size_of::<VideoFrameRecord>() == VIDEO_FRAME_RECORD_SIZE);
    assert!(offset_of!(VideoFrameRecord, width) == 8);
    assert!(offset_of!(VideoFrameRecord, height) == 12);
    assert!(offset_of!(VideoFrameRecord, byte_size) == 16);
};

// ============================================================================
// TESTS
// ============================================================================
