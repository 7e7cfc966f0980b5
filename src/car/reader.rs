//! CAR reading

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use cid::Cid;
use iroh_car::CarReader;
use tokio::fs::File;

use crate::error::{RepoError, Result};

/// Parsed CAR data: the declared root plus every block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCar {
    /// First root CID from the header
    pub root: Cid,
    /// All blocks, keyed by CID
    pub blocks: BTreeMap<Cid, Bytes>,
}

/// Read a CAR file fully into memory
pub async fn read_car(path: impl AsRef<Path>) -> Result<ParsedCar> {
    let file = File::open(path).await.map_err(RepoError::io)?;
    let reader = CarReader::new(file).await.map_err(RepoError::car)?;
    collect_blocks(reader).await
}

/// Read only a CAR file's header roots
pub async fn read_car_header(path: impl AsRef<Path>) -> Result<Vec<Cid>> {
    let file = File::open(path).await.map_err(RepoError::io)?;
    let reader = CarReader::new(file).await.map_err(RepoError::car)?;
    Ok(reader.header().roots().to_vec())
}

/// Parse in-memory CAR bytes (firehose payloads, proofs)
pub async fn parse_car_bytes(data: &[u8]) -> Result<ParsedCar> {
    let reader = CarReader::new(data).await.map_err(RepoError::car)?;
    collect_blocks(reader).await
}

async fn collect_blocks<R>(mut reader: CarReader<R>) -> Result<ParsedCar>
where
    R: tokio::io::AsyncRead + Send + Unpin,
{
    let root = reader
        .header()
        .roots()
        .first()
        .copied()
        .ok_or_else(|| RepoError::new(crate::ErrorKind::Car, None).with_context("CAR has no roots"))?;

    let mut blocks = BTreeMap::new();
    while let Some((cid, data)) = reader.next_block().await.map_err(RepoError::car)? {
        blocks.insert(cid, Bytes::from(data));
    }

    Ok(ParsedCar { root, blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DAG_CBOR, SHA2_256};
    use iroh_car::{CarHeader, CarWriter};
    use sha2::{Digest, Sha256};

    fn test_cid(n: u8) -> Cid {
        let digest = Sha256::digest([n]);
        let mh = multihash::Multihash::wrap(SHA2_256, &digest).unwrap();
        Cid::new_v1(DAG_CBOR, mh)
    }

    async fn make_car(roots: Vec<Cid>, blocks: Vec<(Cid, Vec<u8>)>) -> Vec<u8> {
        let mut buf = Vec::new();
        let header = CarHeader::new_v1(roots);
        let mut writer = CarWriter::new(header, &mut buf);
        for (cid, data) in blocks {
            writer.write(cid, data).await.unwrap();
        }
        writer.finish().await.unwrap();
        buf
    }

    #[tokio::test]
    async fn parse_bytes_with_blocks() {
        let car = make_car(
            vec![test_cid(1)],
            vec![(test_cid(1), vec![1, 2, 3]), (test_cid(2), vec![4, 5])],
        )
        .await;

        let parsed = parse_car_bytes(&car).await.unwrap();
        assert_eq!(parsed.root, test_cid(1));
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks[&test_cid(1)].as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn rootless_car_is_rejected() {
        let car = make_car(vec![], vec![]).await;
        assert!(parse_car_bytes(&car).await.is_err());
    }

    #[tokio::test]
    async fn header_roots_readable_alone() {
        let car = make_car(vec![test_cid(1), test_cid(2)], vec![(test_cid(1), vec![9])]).await;

        let temp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(temp.path(), &car).await.unwrap();

        let roots = read_car_header(temp.path()).await.unwrap();
        assert_eq!(roots, vec![test_cid(1), test_cid(2)]);
    }
}
