//! On-store layouts of nodes, the header and the version chain.
//!
//! All integers are big-endian.
//!
//! ```text
//! Leaf area:
//! ┌───────────┬───────────┬────────────┬─────────────┬─────────────┐
//! │ magic u16 │ fmt u16   │ refcnt u32 │ length u32  │ payload     │
//! └───────────┴───────────┴────────────┴─────────────┴─────────────┘
//!
//! Branch area (n children, array length 4n - 2):
//! ┌───────────┬───────────┬────────────┬──────────────────────────────────┐
//! │ magic u16 │ fmt u16   │ alen u32   │ child0 count0 k1a k1b child1 ... │
//! └───────────┴───────────┴────────────┴──────────────────────────────────┘
//!
//! Header area (fixed, rewritten in place):
//! ┌───────────┬───────────┬──────────────────┐
//! │ magic u32 │ fmt u32   │ version list i64 │
//! └───────────┴───────────┴──────────────────┘
//!
//! Version list area:     magic u32 | count u32 | record area i64 * count
//! Version record area:   magic u32 | deleted u32 | version i64 | root i64
//!                        | deleted node id i64 * deleted
//! ```

use arbor_common::constants::{
    BRANCH_HEADER_SIZE, BRANCH_MAGIC, HEADER_AREA_SIZE, HEADER_MAGIC, LEAF_HEADER_SIZE,
    LEAF_MAGIC, NODE_FORMAT_VERSION, VERSION_LIST_MAGIC, VERSION_RECORD_MAGIC,
};
use arbor_common::error::{ArborError, ArborResult};
use arbor_common::types::{AreaId, Key, NodeId, VersionId};
use arbor_storage::{AreaStore, AreaWriter};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::node::{StoredNode, TreeBranch, TreeLeaf};

/// Area size of a leaf holding `len` bytes.
pub fn leaf_area_size(len: usize) -> usize {
    LEAF_HEADER_SIZE + len
}

/// Area size of a branch with `children` children.
pub fn branch_area_size(children: usize) -> usize {
    BRANCH_HEADER_SIZE + branch_array_len(children) * 8
}

fn branch_array_len(children: usize) -> usize {
    (4 * children).saturating_sub(2)
}

/// Writes a leaf with reference count 1.
pub fn write_leaf<S: AreaStore + ?Sized>(writer: &mut AreaWriter<'_, S>, payload: &[u8]) {
    writer.put_u16(LEAF_MAGIC);
    writer.put_u16(NODE_FORMAT_VERSION);
    writer.put_u32(1);
    writer.put_u32(payload.len() as u32);
    writer.put_slice(payload);
}

/// Writes a branch. Heap children must already be resolved.
pub fn write_branch<S: AreaStore + ?Sized>(
    writer: &mut AreaWriter<'_, S>,
    branch: &TreeBranch,
) -> ArborResult<()> {
    writer.put_u16(BRANCH_MAGIC);
    writer.put_u16(NODE_FORMAT_VERSION);
    writer.put_u32(branch_array_len(branch.len()) as u32);
    for (i, child) in branch.children().iter().enumerate() {
        if child.is_heap() {
            return Err(ArborError::integrity(format!(
                "heap child {child} in persisted branch"
            )));
        }
        if i > 0 {
            let (part1, part2) = branch.keys()[i - 1].encode();
            writer.put_i64(part1);
            writer.put_i64(part2);
        }
        writer.put_i64(child.to_raw());
        writer.put_i64(branch.count(i) as i64);
    }
    Ok(())
}

fn need(buf: &[u8], len: usize, what: &str) -> ArborResult<()> {
    if buf.remaining() < len {
        return Err(ArborError::corruption(format!(
            "{what} truncated: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Decodes a node area.
pub fn decode_node(area: AreaId, data: Bytes) -> ArborResult<StoredNode> {
    let mut buf = &data[..];
    need(buf, 4, "node header")?;
    let magic = buf.get_u16();
    let version = buf.get_u16();
    if version != NODE_FORMAT_VERSION {
        return Err(ArborError::corruption(format!(
            "area {area}: unsupported node format {version}"
        )));
    }
    match magic {
        LEAF_MAGIC => {
            need(buf, 8, "leaf header")?;
            let _refs = buf.get_u32();
            let len = buf.get_u32() as usize;
            need(buf, len, "leaf payload")?;
            Ok(StoredNode::Leaf(TreeLeaf::Stored {
                area,
                payload: data.slice(LEAF_HEADER_SIZE..LEAF_HEADER_SIZE + len),
            }))
        }
        BRANCH_MAGIC => Ok(StoredNode::Branch(decode_branch(area, buf)?.into())),
        other => Err(ArborError::corruption(format!(
            "area {area}: unknown node type {other:#06x}"
        ))),
    }
}

fn decode_branch(area: AreaId, mut buf: &[u8]) -> ArborResult<TreeBranch> {
    need(buf, 4, "branch header")?;
    let array_len = buf.get_u32() as usize;
    if array_len < 2 || (array_len + 2) % 4 != 0 {
        return Err(ArborError::corruption(format!(
            "area {area}: bad branch array length {array_len}"
        )));
    }
    need(buf, array_len * 8, "branch array")?;
    let n = (array_len + 2) / 4;
    let mut children = Vec::with_capacity(n);
    let mut counts = Vec::with_capacity(n);
    let mut keys = Vec::with_capacity(n - 1);
    for i in 0..n {
        if i > 0 {
            let part1 = buf.get_i64();
            let part2 = buf.get_i64();
            keys.push(Key::decode(part1, part2));
        }
        children.push(NodeId::from_raw(buf.get_i64())?);
        counts.push(buf.get_i64() as u64);
    }
    Ok(TreeBranch::new(children, counts, keys))
}

/// Reads the reference count of a leaf area.
pub fn leaf_ref_count(area: AreaId, data: &[u8]) -> ArborResult<u32> {
    let mut buf = data;
    need(buf, LEAF_HEADER_SIZE, "leaf header")?;
    if buf.get_u16() != LEAF_MAGIC {
        return Err(ArborError::corruption(format!(
            "area {area} is not a leaf"
        )));
    }
    buf.advance(2);
    Ok(buf.get_u32())
}

/// Returns true if the area holds a leaf.
pub fn is_leaf_area(data: &[u8]) -> bool {
    data.len() >= 2 && u16::from_be_bytes([data[0], data[1]]) == LEAF_MAGIC
}

/// Encodes the fixed header.
pub fn encode_header(version_list: AreaId) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_AREA_SIZE);
    buf.put_u32(HEADER_MAGIC);
    buf.put_u32(u32::from(NODE_FORMAT_VERSION));
    buf.put_i64(version_list.as_u64() as i64);
    buf.freeze()
}

/// Decodes the fixed header, returning the version list area.
pub fn decode_header(data: &[u8]) -> ArborResult<AreaId> {
    let mut buf = data;
    need(buf, HEADER_AREA_SIZE, "header")?;
    let magic = buf.get_u32();
    if magic != HEADER_MAGIC {
        return Err(ArborError::corruption(format!(
            "bad header magic {magic:#010x}"
        )));
    }
    let _format = buf.get_u32();
    Ok(AreaId::new(buf.get_i64() as u64))
}

/// Encodes the list of version record areas, oldest first.
pub fn encode_version_list(records: &[AreaId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + records.len() * 8);
    buf.put_u32(VERSION_LIST_MAGIC);
    buf.put_u32(records.len() as u32);
    for record in records {
        buf.put_i64(record.as_u64() as i64);
    }
    buf.freeze()
}

/// Decodes the list of version record areas.
pub fn decode_version_list(data: &[u8]) -> ArborResult<Vec<AreaId>> {
    let mut buf = data;
    need(buf, 8, "version list")?;
    let magic = buf.get_u32();
    if magic != VERSION_LIST_MAGIC {
        return Err(ArborError::corruption(format!(
            "bad version list magic {magic:#010x}"
        )));
    }
    let count = buf.get_u32() as usize;
    need(buf, count * 8, "version list")?;
    Ok((0..count)
        .map(|_| AreaId::new(buf.get_i64() as u64))
        .collect())
}

/// One persisted version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    /// Version id.
    pub id: VersionId,
    /// Root node of the version.
    pub root: NodeId,
    /// Nodes to dispose once the version is reclaimed.
    pub deleted: Vec<NodeId>,
}

/// Encodes a version record.
pub fn encode_version_record(record: &VersionRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(24 + record.deleted.len() * 8);
    buf.put_u32(VERSION_RECORD_MAGIC);
    buf.put_u32(record.deleted.len() as u32);
    buf.put_i64(record.id.as_u64() as i64);
    buf.put_i64(record.root.to_raw());
    for node in &record.deleted {
        buf.put_i64(node.to_raw());
    }
    buf.freeze()
}

/// Decodes a version record.
pub fn decode_version_record(data: &[u8]) -> ArborResult<VersionRecord> {
    let mut buf = data;
    need(buf, 24, "version record")?;
    let magic = buf.get_u32();
    if magic != VERSION_RECORD_MAGIC {
        return Err(ArborError::corruption(format!(
            "bad version record magic {magic:#010x}"
        )));
    }
    let count = buf.get_u32() as usize;
    let id = VersionId::new(buf.get_i64() as u64);
    let root = NodeId::from_raw(buf.get_i64())?;
    need(buf, count * 8, "version record")?;
    let deleted = (0..count)
        .map(|_| NodeId::from_raw(buf.get_i64()))
        .collect::<ArborResult<Vec<_>>>()?;
    Ok(VersionRecord { id, root, deleted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_storage::{AreaStoreExt, MemoryAreaStore};

    #[test]
    fn test_leaf_layout() {
        let store = MemoryAreaStore::new();
        let mut writer = store.create_area(leaf_area_size(3)).unwrap();
        write_leaf(&mut writer, b"abc");
        let id = writer.finish().unwrap();

        let data = store.get_area(id).unwrap();
        assert_eq!(&data[..12], &[0x01, 0x9E, 0, 1, 0, 0, 0, 1, 0, 0, 0, 3]);
        assert_eq!(leaf_ref_count(id, &data).unwrap(), 1);
        assert!(is_leaf_area(&data));

        match decode_node(id, data).unwrap() {
            StoredNode::Leaf(TreeLeaf::Stored { payload, .. }) => assert_eq!(&payload[..], b"abc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_branch_layout() {
        let branch = TreeBranch::new(
            vec![NodeId::Stored(AreaId::new(4)), NodeId::sparse(0, 9), NodeId::Stored(AreaId::new(5))],
            vec![10, 9, 30],
            vec![Key::new(1, 2, 3), Key::new(1, 2, 4)],
        );
        let store = MemoryAreaStore::new();
        let mut writer = store.create_area(branch_area_size(3)).unwrap();
        write_branch(&mut writer, &branch).unwrap();
        let id = writer.finish().unwrap();

        let data = store.get_area(id).unwrap();
        assert_eq!(data.len(), 8 + 10 * 8);
        assert_eq!(&data[..8], &[0x02, 0x2E, 0, 1, 0, 0, 0, 10]);
        assert!(!is_leaf_area(&data));

        match decode_node(id, data).unwrap() {
            StoredNode::Branch(decoded) => assert_eq!(*decoded, branch),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_heap_child_rejected() {
        let branch = TreeBranch::new(
            vec![NodeId::Heap(-1), NodeId::sparse(0, 1)],
            vec![1, 1],
            vec![Key::TAIL],
        );
        let store = MemoryAreaStore::new();
        let mut writer = store.create_area(branch_area_size(2)).unwrap();
        assert!(write_branch(&mut writer, &branch).is_err());
    }

    #[test]
    fn test_header_and_versions() {
        let header = encode_header(AreaId::new(77));
        assert_eq!(header.len(), HEADER_AREA_SIZE);
        assert_eq!(decode_header(&header).unwrap(), AreaId::new(77));
        assert!(decode_header(&header[..8]).is_err());

        let list = encode_version_list(&[AreaId::new(1), AreaId::new(9)]);
        assert_eq!(
            decode_version_list(&list).unwrap(),
            vec![AreaId::new(1), AreaId::new(9)]
        );

        let record = VersionRecord {
            id: VersionId::new(3),
            root: NodeId::Stored(AreaId::new(12)),
            deleted: vec![NodeId::Stored(AreaId::new(2)), NodeId::sparse(0, 4)],
        };
        let encoded = encode_version_record(&record);
        assert_eq!(decode_version_record(&encoded).unwrap(), record);
        assert!(decode_version_record(&encoded[..20]).is_err());
    }

    #[test]
    fn test_corrupt_node() {
        let bad = Bytes::from_static(&[0xFF, 0xFF, 0, 1]);
        assert!(decode_node(AreaId::new(1), bad).is_err());
        let short_leaf = Bytes::from_static(&[0x01, 0x9E, 0, 1, 0, 0, 0, 1, 0, 0, 0, 9, 1]);
        assert!(decode_node(AreaId::new(1), short_leaf).is_err());
    }
}
