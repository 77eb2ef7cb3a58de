//! CARv1 archives
//!
//! A CAR stream is a varint-prefixed DAG-CBOR header `{roots, version: 1}`
//! followed by sections of `varint(len) || cid || block`. Every block read
//! back is re-hashed against its CID.

use std::collections::HashSet;
use std::io::{Cursor, Read, Write};

use cid::Cid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::codec;
use crate::error::RepoError;
use crate::store::{BlockMap, BlockStore};

/// Upper bound on a single header or section
pub const MAX_SECTION_LEN: u64 = 4 * 1024 * 1024;

/// CAR header. Fields are declared in canonical DAG-CBOR key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
    pub version: u64,
}

fn write_varint<W: Write>(out: &mut W, mut value: u64) -> Result<(), RepoError> {
    let mut buf = [0u8; 10];
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            i += 1;
            break;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
    out.write_all(&buf[..i])?;
    Ok(())
}

/// Read an unsigned LEB128 varint, `None` on clean end of stream
fn read_varint<R: Read>(input: &mut R) -> Result<Option<u64>, RepoError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    let mut byte = [0u8; 1];
    loop {
        let n = input.read(&mut byte)?;
        if n == 0 {
            if shift == 0 {
                return Ok(None);
            }
            return Err(RepoError::InvalidCar("truncated varint".to_string()));
        }
        if shift >= 63 && byte[0] > 1 {
            return Err(RepoError::InvalidCar("varint overflows u64".to_string()));
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
}

fn read_exact_section<R: Read>(input: &mut R, len: u64) -> Result<Vec<u8>, RepoError> {
    if len > MAX_SECTION_LEN {
        return Err(RepoError::InvalidCar(format!(
            "section of {} bytes exceeds limit of {}",
            len, MAX_SECTION_LEN
        )));
    }
    let mut buf = vec![0u8; len as usize];
    input.read_exact(&mut buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => RepoError::InvalidCar("truncated section".to_string()),
        _ => RepoError::Io(e),
    })?;
    Ok(buf)
}

/// Streaming CAR writer
pub struct CarWriter<W: Write> {
    out: W,
    written: usize,
}

impl<W: Write> CarWriter<W> {
    /// Write the header and return a writer ready for blocks
    pub fn new(mut out: W, roots: &[Cid]) -> Result<Self, RepoError> {
        let header = codec::encode(&CarHeader {
            roots: roots.to_vec(),
            version: 1,
        })?;
        write_varint(&mut out, header.len() as u64)?;
        out.write_all(&header)?;
        Ok(Self { out, written: 0 })
    }

    pub fn write_block(&mut self, cid: &Cid, bytes: &[u8]) -> Result<(), RepoError> {
        let cid_bytes = cid.to_bytes();
        write_varint(&mut self.out, (cid_bytes.len() + bytes.len()) as u64)?;
        self.out.write_all(&cid_bytes)?;
        self.out.write_all(bytes)?;
        self.written += 1;
        Ok(())
    }

    pub fn blocks_written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> Result<W, RepoError> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Streaming CAR reader yielding hash-verified blocks
pub struct CarReader<R: Read> {
    input: R,
    header: CarHeader,
    done: bool,
}

impl<R: Read> CarReader<R> {
    pub fn new(mut input: R) -> Result<Self, RepoError> {
        let len = read_varint(&mut input)?
            .ok_or_else(|| RepoError::InvalidCar("empty stream".to_string()))?;
        let bytes = read_exact_section(&mut input, len)?;
        let header: CarHeader = codec::decode(&bytes)
            .map_err(|e| RepoError::InvalidCar(format!("bad header: {}", e)))?;
        if header.version != 1 {
            return Err(RepoError::InvalidCar(format!(
                "unsupported CAR version {}",
                header.version
            )));
        }
        Ok(Self {
            input,
            header,
            done: false,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.header.roots
    }

    fn next_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, RepoError> {
        let Some(len) = read_varint(&mut self.input)? else {
            return Ok(None);
        };
        let section = read_exact_section(&mut self.input, len)?;
        let mut cursor = Cursor::new(section.as_slice());
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| RepoError::InvalidCar(format!("bad CID in section: {}", e)))?;
        let offset = cursor.position() as usize;
        let bytes = section[offset..].to_vec();
        codec::verify_block(&cid, &bytes)?;
        Ok(Some((cid, bytes)))
    }
}

impl<R: Read> Iterator for CarReader<R> {
    type Item = Result<(Cid, Vec<u8>), RepoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_block() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Write every block reachable from `roots`, each exactly once.
///
/// Returns the number of blocks written.
pub fn export_car<S, W>(
    store: &S,
    roots: &[Cid],
    out: W,
    cancel: &CancelToken,
) -> Result<usize, RepoError>
where
    S: BlockStore + ?Sized,
    W: Write,
{
    let mut writer = CarWriter::new(out, roots)?;
    let mut seen = HashSet::new();
    write_reachable(store, roots, &mut writer, &mut seen, cancel)?;
    let count = writer.blocks_written();
    writer.finish()?;
    debug!(roots = roots.len(), blocks = count, "exported CAR");
    Ok(count)
}

/// Depth-first walk from `roots` through block links, writing unseen blocks
pub(crate) fn write_reachable<S, W>(
    store: &S,
    roots: &[Cid],
    writer: &mut CarWriter<W>,
    seen: &mut HashSet<Cid>,
    cancel: &CancelToken,
) -> Result<(), RepoError>
where
    S: BlockStore + ?Sized,
    W: Write,
{
    let mut stack: Vec<Cid> = roots.iter().rev().copied().collect();
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        cancel.check()?;
        let bytes = store.get_required(&cid)?;
        let links = codec::block_links(&cid, &bytes)?;
        writer.write_block(&cid, &bytes)?;
        for link in links.into_iter().rev() {
            if !seen.contains(&link) {
                stack.push(link);
            }
        }
    }
    Ok(())
}

/// Partial export: the listed blocks only, under the given roots
pub fn export_blocks<S, W>(store: &S, roots: &[Cid], cids: &[Cid], out: W) -> Result<usize, RepoError>
where
    S: BlockStore + ?Sized,
    W: Write,
{
    let mut writer = CarWriter::new(out, roots)?;
    let mut seen = HashSet::new();
    for cid in cids {
        if seen.insert(*cid) {
            writer.write_block(cid, &store.get_required(cid)?)?;
        }
    }
    let count = writer.blocks_written();
    writer.finish()?;
    Ok(count)
}

/// Serialize an in-memory block set
pub fn write_car(roots: &[Cid], blocks: &BlockMap) -> Result<Vec<u8>, RepoError> {
    let mut writer = CarWriter::new(Vec::new(), roots)?;
    for (cid, bytes) in blocks.iter() {
        writer.write_block(cid, bytes)?;
    }
    writer.finish()
}

/// Parse and verify a whole archive into memory
pub fn read_car(bytes: &[u8]) -> Result<(Vec<Cid>, BlockMap), RepoError> {
    let reader = CarReader::new(bytes)?;
    let roots = reader.roots().to_vec();
    let blocks = reader.collect::<Result<BlockMap, RepoError>>()?;
    Ok((roots, blocks))
}

/// Options for [`import_car`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Fail unless every block reachable from the roots is in the archive or the store
    pub require_complete: bool,
}

/// Outcome of an import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub roots: Vec<Cid>,
    pub blocks_read: usize,
    pub blocks_written: usize,
}

/// Fail with `BlockNotFound` unless every block reachable from `roots` is in
/// `blocks` or already in `store`
pub fn check_complete<S: BlockStore + ?Sized>(
    store: &S,
    blocks: &BlockMap,
    roots: &[Cid],
) -> Result<(), RepoError> {
    let mut seen = HashSet::new();
    let mut stack = roots.to_vec();
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        let links = match blocks.get(&cid) {
            Some(block) => codec::block_links(&cid, block)?,
            None => match store.get(&cid)? {
                Some(block) => codec::block_links(&cid, &block)?,
                None => return Err(RepoError::BlockNotFound(cid)),
            },
        };
        stack.extend(links);
    }
    Ok(())
}

/// Verify an archive and copy its blocks into `store`.
///
/// Nothing is written unless every block in the stream hashes correctly
/// (and, with `require_complete`, every reachable block is available).
pub fn import_car<S: BlockStore + ?Sized>(
    store: &S,
    bytes: &[u8],
    options: ImportOptions,
) -> Result<ImportSummary, RepoError> {
    let (roots, blocks) = read_car(bytes)?;

    if options.require_complete {
        check_complete(store, &blocks, &roots)?;
    }

    let blocks_read = blocks.len();
    let mut fresh = BlockMap::new();
    for (cid, block) in blocks {
        if !store.has(&cid)? {
            fresh.set(cid, block);
        }
    }
    let blocks_written = fresh.len();
    store.put_many(fresh)?;

    info!(
        roots = roots.len(),
        blocks_read,
        blocks_written,
        "imported CAR"
    );
    Ok(ImportSummary {
        roots,
        blocks_read,
        blocks_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mst::Mst;
    use crate::store::MemoryBlockStore;

    fn sample_tree(store: &MemoryBlockStore, count: u32) -> Cid {
        let mst = Mst::new(store);
        let mut pairs = Vec::new();
        for i in 0..count {
            let record = codec::json_to_record(&serde_json::json!({ "n": i })).unwrap();
            let cid = store.put(record).unwrap();
            pairs.push((format!("app.post/{:05}", i), cid));
        }
        mst.build(pairs).unwrap()
    }

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            assert_eq!(read_varint(&mut buf.as_slice()).unwrap(), Some(value));
        }
        assert_eq!(read_varint(&mut [].as_slice()).unwrap(), None);
        assert!(read_varint(&mut [0x80u8].as_slice()).is_err());
    }

    #[test]
    fn test_export_import_roundtrip() {
        let source = MemoryBlockStore::new();
        let root = sample_tree(&source, 50);

        let mut bytes = Vec::new();
        let written = export_car(&source, &[root], &mut bytes, &CancelToken::new()).unwrap();
        // 50 records plus at least one node
        assert!(written > 50);

        let target = MemoryBlockStore::new();
        let summary = import_car(&target, &bytes, ImportOptions { require_complete: true }).unwrap();
        assert_eq!(summary.roots, vec![root]);
        assert_eq!(summary.blocks_read, written);
        assert_eq!(summary.blocks_written, written);

        let before = Mst::new(&source).leaves(&root).unwrap();
        let after = Mst::new(&target).leaves(&root).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_export_writes_each_block_once() {
        let store = MemoryBlockStore::new();
        // identical payloads share one record block
        let record = store.put(codec::json_to_record(&serde_json::json!({"same": true})).unwrap()).unwrap();
        let root = Mst::new(&store)
            .build((0..20).map(|i| (format!("app.like/{:03}", i), record)))
            .unwrap();

        let mut bytes = Vec::new();
        export_car(&store, &[root, root], &mut bytes, &CancelToken::new()).unwrap();
        let (roots, blocks) = read_car(&bytes).unwrap();
        assert_eq!(roots, vec![root, root]);
        let reader = CarReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.count(), blocks.len());
    }

    #[test]
    fn test_tampered_block_rejected() {
        let source = MemoryBlockStore::new();
        let root = sample_tree(&source, 10);
        let mut bytes = Vec::new();
        export_car(&source, &[root], &mut bytes, &CancelToken::new()).unwrap();

        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let target = MemoryBlockStore::new();
        assert!(matches!(
            import_car(&target, &bytes, ImportOptions::default()),
            Err(RepoError::HashMismatch { .. })
        ));
        // nothing was written
        assert!(target.is_empty());
    }

    #[test]
    fn test_incomplete_archive() {
        let source = MemoryBlockStore::new();
        let root = sample_tree(&source, 10);
        let root_bytes = source.get(&root).unwrap().unwrap();

        let mut only_root = BlockMap::new();
        only_root.set(root, root_bytes);
        let bytes = write_car(&[root], &only_root).unwrap();

        let target = MemoryBlockStore::new();
        assert!(matches!(
            import_car(&target, &bytes, ImportOptions { require_complete: true }),
            Err(RepoError::BlockNotFound(_))
        ));
        // partial archives are fine without the reachability check
        let summary = import_car(&target, &bytes, ImportOptions::default()).unwrap();
        assert_eq!(summary.blocks_written, 1);
    }

    #[test]
    fn test_partial_export() {
        let store = MemoryBlockStore::new();
        let root = sample_tree(&store, 30);
        let path = Mst::new(&store).cids_for_path(&root, "app.post/00007").unwrap();

        let mut bytes = Vec::new();
        let count = export_blocks(&store, &[root], &path, &mut bytes).unwrap();
        assert_eq!(count, path.len());
        let (_, blocks) = read_car(&bytes).unwrap();
        assert!(path.iter().all(|cid| blocks.has(cid)));
    }

    #[test]
    fn test_garbage_is_invalid_car() {
        assert!(matches!(read_car(&[]), Err(RepoError::InvalidCar(_))));
        assert!(matches!(read_car(&[0x05, 0x01, 0x02]), Err(RepoError::InvalidCar(_))));
        // header length far beyond the section limit
        assert!(matches!(
            read_car(&[0xff, 0xff, 0xff, 0xff, 0x0f]),
            Err(RepoError::InvalidCar(_))
        ));
    }

    #[test]
    fn test_export_honors_cancel() {
        let store = MemoryBlockStore::new();
        let root = sample_tree(&store, 10);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            export_car(&store, &[root], Vec::new(), &cancel),
            Err(RepoError::Cancelled)
        ));
    }
}
