//! Deletion vectors: compressed bitmaps of logically-deleted row indices.
//!
//! A deletion vector belongs to exactly one data file and marks row indices within that file
//! as soft-deleted. Small vectors travel inline in the log (z85-encoded); larger ones are
//! written to `deletion_vector_<uuid>.bin` next to the data files. The descriptor's
//! `cardinality` always equals the population count of the encoded bitmap.

use roaring::RoaringBitmap;
use uuid::Uuid;

use crate::actions::DeletionVectorDescriptor;
use crate::error::{DeltaResult, Error};
use crate::path::deletion_vector_file_name;
use crate::row::Row;
use crate::storage::{join_path, StorageBackend};
use crate::utils::require;

pub const DV_STORAGE_UUID: &str = "u";
pub const DV_STORAGE_PATH: &str = "p";
pub const DV_STORAGE_INLINE: &str = "i";

/// Vectors at or under this serialized size are stored inline in the descriptor.
const INLINE_THRESHOLD_BYTES: usize = 512;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionVector {
    bitmap: RoaringBitmap,
}

impl DeletionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_indices(indices: impl IntoIterator<Item = u32>) -> Self {
        DeletionVector {
            bitmap: indices.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, row_index: u32) {
        self.bitmap.insert(row_index);
    }

    pub fn contains(&self, row_index: u32) -> bool {
        self.bitmap.contains(row_index)
    }

    pub fn cardinality(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    pub fn union(&mut self, other: &DeletionVector) {
        self.bitmap |= &other.bitmap;
    }

    /// Drop soft-deleted rows; `rows` must be the file's rows in physical order.
    pub fn filter_rows(&self, rows: Vec<Row>) -> Vec<Row> {
        if self.is_empty() {
            return rows;
        }
        rows.into_iter()
            .enumerate()
            .filter(|(idx, _)| !self.bitmap.contains(*idx as u32))
            .map(|(_, row)| row)
            .collect()
    }

    fn serialize(&self) -> DeltaResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.bitmap.serialized_size());
        self.bitmap
            .serialize_into(&mut bytes)
            .map_err(|e| Error::internal(format!("bitmap serialization failed: {e}")))?;
        Ok(bytes)
    }

    fn deserialize(bytes: &[u8]) -> DeltaResult<Self> {
        let bitmap = RoaringBitmap::deserialize_from(bytes)
            .map_err(|e| Error::validation(format!("malformed deletion vector bitmap: {e}")))?;
        Ok(DeletionVector { bitmap })
    }

    /// Produce a descriptor, writing an external `.bin` file when the bitmap is too large to
    /// inline. The descriptor's cardinality is taken from the bitmap itself.
    pub async fn into_descriptor(
        self,
        storage: &dyn StorageBackend,
        table_root: &str,
    ) -> DeltaResult<DeletionVectorDescriptor> {
        let bytes = self.serialize()?;
        let size_in_bytes = bytes.len() as i32;
        let cardinality = self.cardinality() as i64;
        if bytes.len() <= INLINE_THRESHOLD_BYTES {
            // z85 needs a multiple of four bytes; pad and let size_in_bytes recover the tail
            let mut padded = bytes;
            while padded.len() % 4 != 0 {
                padded.push(0);
            }
            Ok(DeletionVectorDescriptor {
                storage_type: DV_STORAGE_INLINE.to_string(),
                path_or_inline_dv: z85::encode(&padded),
                offset: None,
                size_in_bytes,
                cardinality,
            })
        } else {
            let uuid = Uuid::new_v4();
            let path = join_path(table_root, &deletion_vector_file_name(&uuid));
            storage.write(&path, bytes.into()).await?;
            Ok(DeletionVectorDescriptor {
                storage_type: DV_STORAGE_UUID.to_string(),
                path_or_inline_dv: uuid.to_string(),
                offset: None,
                size_in_bytes,
                cardinality,
            })
        }
    }

    /// Decode a descriptor back into a bitmap, fetching the external file if needed.
    pub async fn from_descriptor(
        descriptor: &DeletionVectorDescriptor,
        storage: &dyn StorageBackend,
        table_root: &str,
    ) -> DeltaResult<Self> {
        let bytes = match descriptor.storage_type.as_str() {
            DV_STORAGE_INLINE => {
                let padded = z85::decode(&descriptor.path_or_inline_dv).map_err(|e| {
                    Error::validation(format!("malformed inline deletion vector: {e}"))
                })?;
                require!(
                    padded.len() >= descriptor.size_in_bytes as usize,
                    Error::validation("inline deletion vector shorter than its declared size")
                );
                padded[..descriptor.size_in_bytes as usize].to_vec()
            }
            DV_STORAGE_UUID => {
                let uuid: Uuid = descriptor.path_or_inline_dv.parse().map_err(|_| {
                    Error::validation(format!(
                        "bad deletion vector uuid '{}'",
                        descriptor.path_or_inline_dv
                    ))
                })?;
                let path = join_path(table_root, &deletion_vector_file_name(&uuid));
                read_dv_bytes(storage, &path, descriptor).await?
            }
            DV_STORAGE_PATH => {
                read_dv_bytes(storage, &descriptor.path_or_inline_dv, descriptor).await?
            }
            other => {
                return Err(Error::validation(format!(
                    "unknown deletion vector storage type '{other}'"
                )))
            }
        };
        let dv = Self::deserialize(&bytes)?;
        require!(
            dv.cardinality() as i64 == descriptor.cardinality,
            Error::validation(format!(
                "deletion vector cardinality mismatch: descriptor says {}, bitmap has {}",
                descriptor.cardinality,
                dv.cardinality()
            ))
        );
        Ok(dv)
    }
}

async fn read_dv_bytes(
    storage: &dyn StorageBackend,
    path: &str,
    descriptor: &DeletionVectorDescriptor,
) -> DeltaResult<Vec<u8>> {
    match descriptor.offset {
        Some(offset) => {
            let start = offset as u64;
            let end = start + descriptor.size_in_bytes as u64;
            Ok(storage.read_range(path, start, end).await?.to_vec())
        }
        None => Ok(storage.read(path).await?.to_vec()),
    }
}
