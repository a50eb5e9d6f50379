use std::path::{Path, PathBuf};

/// One contiguous byte range of a transfer, downloaded into its own temp file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    /// First byte, inclusive.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
    pub temp_path: PathBuf,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        if self.end >= self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `[0, total_bytes)` into `connections` equal chunks, the last one taking
/// the remainder. The count is clamped so that no chunk is empty.
pub fn build_chunks(total_bytes: u64, connections: u32, temp_dir: &Path) -> Vec<Chunk> {
    if total_bytes == 0 {
        return Vec::new();
    }
    let count = u64::from(connections.max(1)).min(total_bytes);
    let base = total_bytes / count;

    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count {
        let end = if index == count - 1 {
            total_bytes - 1
        } else {
            start + base - 1
        };
        chunks.push(Chunk {
            index: index as usize,
            start,
            end,
            temp_path: temp_dir.join(format!("chunk_{}.part", index)),
        });
        start = end + 1;
    }
    chunks
}
