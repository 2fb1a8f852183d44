//! Block indexing for uploaded files.
//!
//! A spooled upload is split into fixed 1 MiB blocks. One task per block
//! opens the file, reads its slice, optionally encrypts it, and writes
//! the block under its SHA-1; results rendezvous on a channel carrying
//! `(index, id)` so out-of-order completion still assembles in order.

use crate::error::{RepoError, RepoResult};
use crate::store::{BlockStore, FsStore};
use bytes::Bytes;
use reef_core::fs::FileObject;
use reef_core::{CryptKey, ObjectId, BLOCK_SIZE};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

/// Split, hash and persist `file_path`, then write the file object.
///
/// Returns the file object id and the plaintext size.
pub async fn index_blocks(
    fs: &FsStore,
    blocks: &BlockStore,
    store_id: &str,
    version: u32,
    file_path: &Path,
    crypt_key: Option<&CryptKey>,
) -> RepoResult<(ObjectId, i64)> {
    let file_size = tokio::fs::metadata(file_path).await?.len();
    let block_ids = split_file(blocks, store_id, file_path, file_size, crypt_key).await?;

    let file = FileObject::new(version, file_size, block_ids);
    let file_id = fs.save_file(store_id, &file).await?;
    Ok((file_id, file_size as i64))
}

async fn split_file(
    blocks: &BlockStore,
    store_id: &str,
    file_path: &Path,
    file_size: u64,
    crypt_key: Option<&CryptKey>,
) -> RepoResult<Vec<ObjectId>> {
    let num_blocks = file_size.div_ceil(BLOCK_SIZE) as usize;
    if num_blocks == 0 {
        return Ok(Vec::new());
    }

    let (tx, mut rx) = mpsc::channel::<(usize, RepoResult<ObjectId>)>(num_blocks);
    for idx in 0..num_blocks {
        let tx = tx.clone();
        let blocks = blocks.clone();
        let store_id = store_id.to_string();
        let path = file_path.to_path_buf();
        let crypt_key = crypt_key.cloned();
        let offset = idx as u64 * BLOCK_SIZE;
        let len = (file_size - offset).min(BLOCK_SIZE) as usize;
        tokio::spawn(async move {
            let result = chunking_worker(&blocks, &store_id, &path, offset, len, crypt_key).await;
            let _ = tx.send((idx, result)).await;
        });
    }
    drop(tx);

    let mut block_ids = vec![ObjectId::compute(b""); num_blocks];
    let mut received = 0;
    while let Some((idx, result)) = rx.recv().await {
        block_ids[idx] = result?;
        received += 1;
    }
    if received != num_blocks {
        return Err(RepoError::Io(std::io::Error::other(
            "chunking worker dropped its result",
        )));
    }
    Ok(block_ids)
}

async fn chunking_worker(
    blocks: &BlockStore,
    store_id: &str,
    path: &Path,
    offset: u64,
    len: usize,
    crypt_key: Option<CryptKey>,
) -> RepoResult<ObjectId> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;

    let payload = match &crypt_key {
        Some(key) => key.encrypt(&buf),
        None => buf,
    };
    blocks.write(store_id, Bytes::from(payload)).await
}
