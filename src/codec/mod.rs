//! Binary Layout Codec
//!
//! Dieses Modul übersetzt Host-Daten in die festen Wire-Layouts der
//! nativen Engine und zurück:
//! - Blob-Records (length-prefixed Byte-Buffer)
//! - Batch-Records (Array von Blob-Records mit festem Stride)
//! - String-Records (UTF-8 im Blob-Layout)

mod arena;
mod layout;
mod marshal;

pub use arena::{ArenaPolicy, BoundaryArena, MarshalFrame};
pub use layout::{
    BatchRecord, BlobRecord, VideoFrameRecord, BATCH_ROWS_OFFSET, BATCH_ROW_STRIDE,
    BLOB_RECORD_SIZE, VIDEO_FRAME_RECORD_SIZE,
};
pub use marshal::{
    decode_blob, decode_blob_batch, decode_raw, decode_text, encode_blob, encode_blob_batch,
    encode_text, preview, CodecError, OpaqueBlob,
};
