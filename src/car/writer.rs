//! CAR writing

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use cid::Cid;
use iroh_car::{CarHeader, CarWriter};
use tokio::fs::File;

use crate::error::{RepoError, Result};
use crate::mst::Mst;
use crate::storage::BlockStore;

/// Write blocks to a CAR file
///
/// Blocks go out in sorted CID order (`BTreeMap` iteration) for determinism.
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: Vec<Cid>,
    blocks: BTreeMap<Cid, Bytes>,
) -> Result<()> {
    let file = File::create(path).await.map_err(RepoError::io)?;

    let header = CarHeader::new_v1(roots);
    let mut writer = CarWriter::new(header, file);

    for (cid, data) in blocks {
        writer
            .write(cid, data.as_ref())
            .await
            .map_err(RepoError::car)?;
    }

    writer.finish().await.map_err(RepoError::car)?;
    Ok(())
}

/// Write blocks to in-memory CAR bytes
///
/// Used for firehose commit payloads and tests.
pub async fn write_car_bytes(root: Cid, blocks: &BTreeMap<Cid, Bytes>) -> Result<Bytes> {
    let mut buffer = Vec::new();
    let header = CarHeader::new_v1(vec![root]);
    let mut writer = CarWriter::new(header, &mut buffer);

    for (cid, data) in blocks {
        writer
            .write(*cid, data.as_ref())
            .await
            .map_err(RepoError::car)?;
    }

    writer.finish().await.map_err(RepoError::car)?;
    Ok(Bytes::from(buffer))
}

/// Stream a full repository to a CAR file
///
/// The head commit block goes first, then every MST node and record block
/// reachable from it, read straight from storage so nothing is buffered.
pub async fn export_repo_car<S: BlockStore + Sync + 'static>(
    path: impl AsRef<Path>,
    commit_cid: Cid,
    mst: &Mst<S>,
) -> Result<()> {
    let file = File::create(path).await.map_err(RepoError::io)?;

    let header = CarHeader::new_v1(vec![commit_cid]);
    let mut writer = CarWriter::new(header, file);

    let commit_bytes = mst
        .storage()
        .get(&commit_cid)
        .await?
        .ok_or_else(|| RepoError::block_not_found(commit_cid))?;
    writer
        .write(commit_cid, &commit_bytes)
        .await
        .map_err(RepoError::car)?;

    mst.write_blocks_to_car(&mut writer).await?;

    writer.finish().await.map_err(RepoError::car)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::reader::read_car;
    use crate::storage::MemoryStorage;
    use crate::{DAG_CBOR, SHA2_256};
    use sha2::{Digest, Sha256};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn test_cid(n: u8) -> Cid {
        let digest = Sha256::digest([n]);
        let mh = multihash::Multihash::wrap(SHA2_256, &digest).unwrap();
        Cid::new_v1(DAG_CBOR, mh)
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let temp = NamedTempFile::new().unwrap();

        let mut blocks = BTreeMap::new();
        blocks.insert(test_cid(1), Bytes::from_static(&[1, 2, 3]));
        blocks.insert(test_cid(2), Bytes::from_static(&[4, 5, 6]));

        write_car(temp.path(), vec![test_cid(1)], blocks.clone())
            .await
            .unwrap();

        let parsed = read_car(temp.path()).await.unwrap();
        assert_eq!(parsed.root, test_cid(1));
        assert_eq!(parsed.blocks, blocks);
    }

    #[tokio::test]
    async fn car_bytes_roundtrip() {
        let mut blocks = BTreeMap::new();
        blocks.insert(test_cid(3), Bytes::from_static(b"payload"));

        let bytes = write_car_bytes(test_cid(3), &blocks).await.unwrap();
        let parsed = crate::car::parse_car_bytes(&bytes).await.unwrap();
        assert_eq!(parsed.root, test_cid(3));
        assert_eq!(parsed.blocks, blocks);
    }

    #[tokio::test]
    async fn export_covers_commit_nodes_and_records() {
        let storage = Arc::new(MemoryStorage::new());
        let mut mst = Mst::new(storage.clone());

        let rec1 = storage.put(b"record one").await.unwrap();
        let rec2 = storage.put(b"record two").await.unwrap();
        mst = mst.add("app.bsky.feed.post/aaa", rec1).await.unwrap();
        mst = mst.add("app.bsky.feed.post/bbb", rec2).await.unwrap();
        mst.persist().await.unwrap();

        let commit_cid = storage.put(b"fake commit block").await.unwrap();

        let temp = NamedTempFile::new().unwrap();
        export_repo_car(temp.path(), commit_cid, &mst).await.unwrap();

        let parsed = read_car(temp.path()).await.unwrap();
        assert_eq!(parsed.root, commit_cid);
        assert!(parsed.blocks.contains_key(&commit_cid));
        assert!(parsed.blocks.contains_key(&mst.root().await.unwrap()));
        assert!(parsed.blocks.contains_key(&rec1));
        assert!(parsed.blocks.contains_key(&rec2));
    }
}
