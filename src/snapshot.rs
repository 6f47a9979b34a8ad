//! Snapshot manifests and the lazy chunk stream used for
//! InstallSnapshot transfers.

use std::io;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::log::TermIndex;
use crate::proto;

/// One file of a snapshot, addressed relative to the snapshot root.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub relative_path: PathBuf,
    pub size: u64,
    /// Whole-file digest, precomputed when the snapshot was taken.
    pub digest: Vec<u8>,
}

/// Immutable manifest of a state-machine snapshot.
///
/// Files are streamed to followers in list order.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub term_index: TermIndex,
    pub root: PathBuf,
    pub files: Vec<FileInfo>,
}

impl Snapshot {
    pub fn index(&self) -> u64 {
        self.term_index.index
    }

    pub fn term(&self) -> u64 {
        self.term_index.term
    }
}

struct OpenFile {
    file: File,
    size: u64,
    offset: u64,
    chunk_index: u32,
    // One allocation per file, reused across its chunks.
    buf: Vec<u8>,
}

/// Ordered, lazy producer of InstallSnapshot requests for one snapshot.
///
/// Owns the handle of the file currently being read; the handle is
/// released when the file is exhausted, on a read error, and on drop, so
/// early termination never leaks it. Replaying a new stream over the same
/// snapshot yields the same chunk sequence.
pub struct SnapshotChunkStream {
    snapshot: Snapshot,
    leader_term: u64,
    leader_id: u64,
    target_id: u64,
    chunk_max: usize,
    request_id: String,
    request_index: u32,
    file_pos: usize,
    current: Option<OpenFile>,
}

impl SnapshotChunkStream {
    pub async fn new(
        snapshot: Snapshot,
        leader_term: u64,
        leader_id: u64,
        target_id: u64,
        request_id: String,
        chunk_max: usize,
    ) -> io::Result<Self> {
        let mut stream = Self {
            snapshot,
            leader_term,
            leader_id,
            target_id,
            chunk_max,
            request_id,
            request_index: 0,
            file_pos: 0,
            current: None,
        };
        if !stream.snapshot.files.is_empty() {
            stream.open_current().await?;
        }
        Ok(stream)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    async fn open_current(&mut self) -> io::Result<()> {
        let info = &self.snapshot.files[self.file_pos];
        let path = self.snapshot.root.join(&info.relative_path);
        let file = File::open(&path).await?;
        let buf_len = (self.chunk_max as u64).min(info.size) as usize;
        self.current = Some(OpenFile {
            file,
            size: info.size,
            offset: 0,
            chunk_index: 0,
            buf: vec![0u8; buf_len],
        });
        Ok(())
    }

    /// Next request in the stream, or `None` once every file is sent.
    pub async fn next_request(&mut self) -> io::Result<Option<proto::InstallSnapshotRequest>> {
        let open = match self.current.as_mut() {
            Some(open) => open,
            None => return Ok(None),
        };
        let info = &self.snapshot.files[self.file_pos];
        let len = (open.size - open.offset).min(self.chunk_max as u64) as usize;

        if let Err(e) = open.file.read_exact(&mut open.buf[..len]).await {
            // release the handle before surfacing the error
            self.current = None;
            return Err(e);
        }

        let file_done = open.offset + len as u64 == open.size;
        let chunk = proto::FileChunk {
            filename: info.relative_path.to_string_lossy().into_owned(),
            offset: open.offset,
            chunk_index: open.chunk_index,
            data: open.buf[..len].to_vec(),
            done: file_done,
            file_digest: info.digest.clone(),
        };
        let request = proto::InstallSnapshotRequest {
            leader_term: self.leader_term,
            leader_id: self.leader_id,
            target_id: self.target_id,
            request_id: self.request_id.clone(),
            request_index: self.request_index,
            term_index: Some(self.snapshot.term_index.into()),
            chunks: vec![chunk],
            done: file_done && self.file_pos == self.snapshot.files.len() - 1,
        };
        self.request_index += 1;
        open.offset += len as u64;
        open.chunk_index += 1;

        if file_done {
            self.current = None;
            self.file_pos += 1;
            if self.file_pos < self.snapshot.files.len() {
                self.open_current().await?;
            }
        }

        Ok(Some(request))
    }
}
