use std::io::Read;

use log::debug;

use crate::{
    error::DbError,
    io::{get_u16, get_u32, put_u16, put_u32, read_exact, Decodeable, Encodeable},
    types::DbResult,
    vol::{tag, PageBuf, PageId, StoreId, Volume, PAGE_HEADER_SIZE},
};

pub const MAX_STORES: usize = 255;

/// Bytes per stnode slot: root u32, flags u16, deleting u8, pad u8.
const SLOT_BYTES: usize = 8;

pub mod store_flags {
    pub const ST_NONE: u16 = 0;
    pub const ST_REGULAR: u16 = 0x01;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreNode {
    pub root: u32,
    pub flags: u16,
    pub deleting: bool,
}

impl StoreNode {
    fn empty() -> Self {
        Self {
            root: 0,
            flags: store_flags::ST_NONE,
            deleting: false,
        }
    }

    pub fn is_used(&self) -> bool {
        self.root != 0 || self.flags != store_flags::ST_NONE
    }
}

/// The kinds of store-table mutation carried by a `store_operation` log
/// record. Every kind except `DeleteStore` is undoable by restoring the
/// previous field value; destroying a store's content is not.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreOp {
    CreateStore { flags: u16 },
    SetRoot { root: u32, prev_root: u32 },
    SetFlags { flags: u16, prev_flags: u16 },
    SetDeleting { deleting: bool, prev: bool },
    DeleteStore,
}

impl StoreOp {
    fn code(&self) -> u8 {
        match self {
            StoreOp::CreateStore { .. } => 0,
            StoreOp::SetRoot { .. } => 1,
            StoreOp::SetFlags { .. } => 2,
            StoreOp::SetDeleting { .. } => 3,
            StoreOp::DeleteStore => 4,
        }
    }
}

/// Wire format: code u8, then two u32 operands (current, previous).
impl Encodeable for StoreOp {
    fn encode(&self) -> Vec<u8> {
        let (a, b): (u32, u32) = match *self {
            StoreOp::CreateStore { flags } => (flags as u32, 0),
            StoreOp::SetRoot { root, prev_root } => (root, prev_root),
            StoreOp::SetFlags { flags, prev_flags } => (flags as u32, prev_flags as u32),
            StoreOp::SetDeleting { deleting, prev } => (deleting as u32, prev as u32),
            StoreOp::DeleteStore => (0, 0),
        };
        let mut buf = vec![self.code()];
        buf.extend_from_slice(&a.to_le_bytes());
        buf.extend_from_slice(&b.to_le_bytes());
        buf
    }
}

impl Decodeable for StoreOp {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let code = read_exact(reader, 1)[0];
        let a = u32::decode_from(reader);
        let b = u32::decode_from(reader);
        match code {
            0 => StoreOp::CreateStore { flags: a as u16 },
            1 => StoreOp::SetRoot {
                root: a,
                prev_root: b,
            },
            2 => StoreOp::SetFlags {
                flags: a as u16,
                prev_flags: b as u16,
            },
            3 => StoreOp::SetDeleting {
                deleting: a != 0,
                prev: b != 0,
            },
            4 => StoreOp::DeleteStore,
            _ => panic!("corrupt store operation code: {}", code),
        }
    }
}

/// In-memory image of the store-table (stnode) page: 255 slots of
/// `{root, flags, deleting}`. Store numbers are 1-based; slot 0 is
/// never handed out.
pub struct StoreTable {
    nodes: Vec<StoreNode>,
}

impl StoreTable {
    pub fn load(volume: &Volume) -> Result<StoreTable, DbError> {
        let mut page = PageBuf::new();
        volume.read_page(volume.stnode_pid(), &mut page)?;

        let mut nodes = vec![StoreNode::empty(); MAX_STORES + 1];
        let body = &page.bytes()[PAGE_HEADER_SIZE..];
        for snum in 1..=MAX_STORES {
            let off = (snum - 1) * SLOT_BYTES;
            nodes[snum] = StoreNode {
                root: get_u32(body, off),
                flags: get_u16(body, off + 4),
                deleting: body[off + 6] != 0,
            };
        }
        Ok(StoreTable { nodes })
    }

    pub fn get(&self, snum: StoreId) -> Result<StoreNode, DbError> {
        let node = self
            .nodes
            .get(snum as usize)
            .copied()
            .unwrap_or_else(|| panic!("store number {} out of range", snum));
        if !node.is_used() {
            return Err(DbError::internal(&format!("store {} does not exist", snum)));
        }
        Ok(node)
    }

    pub fn get_store_root(&self, snum: StoreId, vid: u32) -> Result<PageId, DbError> {
        let node = self.get(snum)?;
        Ok(PageId::new(vid, node.root))
    }

    /// Find a free slot. The actual creation is applied through
    /// `apply`, so that forward execution and REDO share one code path.
    pub fn next_free_store(&self) -> Result<StoreId, DbError> {
        for snum in 1..=MAX_STORES {
            if !self.nodes[snum].is_used() {
                return Ok(snum as StoreId);
            }
        }
        Err(DbError::out_of_space("store table full"))
    }

    /// Apply a store operation. Used by forward execution, REDO, and
    /// (inverted) UNDO.
    pub fn apply(&mut self, snum: StoreId, op: StoreOp) {
        let node = &mut self.nodes[snum as usize];
        match op {
            StoreOp::CreateStore { flags } => {
                node.flags = flags | store_flags::ST_REGULAR;
                node.deleting = false;
            }
            StoreOp::SetRoot { root, .. } => node.root = root,
            StoreOp::SetFlags { flags, .. } => node.flags = flags,
            StoreOp::SetDeleting { deleting, .. } => node.deleting = deleting,
            StoreOp::DeleteStore => {
                *node = StoreNode::empty();
            }
        }
        debug!("store {} <- {:?}", snum, op);
    }

    /// The inverse operation, for UNDO. `DeleteStore` destroys content
    /// and cannot be reversed.
    pub fn invert(op: StoreOp) -> Option<StoreOp> {
        match op {
            StoreOp::CreateStore { .. } => Some(StoreOp::DeleteStore),
            StoreOp::SetRoot { root, prev_root } => Some(StoreOp::SetRoot {
                root: prev_root,
                prev_root: root,
            }),
            StoreOp::SetFlags { flags, prev_flags } => Some(StoreOp::SetFlags {
                flags: prev_flags,
                prev_flags: flags,
            }),
            StoreOp::SetDeleting { deleting, prev } => Some(StoreOp::SetDeleting {
                deleting: prev,
                prev: deleting,
            }),
            StoreOp::DeleteStore => None,
        }
    }

    pub fn used_stores(&self) -> Vec<StoreId> {
        (1..=MAX_STORES)
            .filter(|&s| self.nodes[s].is_used())
            .map(|s| s as StoreId)
            .collect()
    }

    pub fn flush(&self, volume: &Volume) -> DbResult {
        let pid = volume.stnode_pid();
        let mut page = PageBuf::new();
        page.set_pid(pid);
        page.set_tag(tag::T_STNODE);
        {
            let body = &mut page.bytes_mut()[PAGE_HEADER_SIZE..];
            for snum in 1..=MAX_STORES {
                let off = (snum - 1) * SLOT_BYTES;
                let node = &self.nodes[snum];
                put_u32(body, off, node.root);
                put_u16(body, off + 4, node.flags);
                body[off + 6] = node.deleting as u8;
            }
        }
        page.update_checksum();
        volume.write_page(pid, &page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_volume(name: &str) -> Volume {
        let dir = std::env::temp_dir().join(format!("foster-stnode-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Volume::format(&path, 1, 128).unwrap()
    }

    #[test]
    fn test_create_and_persist() {
        let vol = test_volume("stnode-a.db");
        let mut table = StoreTable::load(&vol).unwrap();

        let snum = table.next_free_store().unwrap();
        assert_eq!(snum, 1);
        table.apply(snum, StoreOp::CreateStore { flags: 0 });
        table.apply(
            snum,
            StoreOp::SetRoot {
                root: 42,
                prev_root: 0,
            },
        );
        table.flush(&vol).unwrap();

        let reloaded = StoreTable::load(&vol).unwrap();
        assert_eq!(reloaded.get(snum).unwrap().root, 42);
        assert_eq!(reloaded.next_free_store().unwrap(), 2);
    }

    #[test]
    fn test_invert_round_trip() {
        let op = StoreOp::SetRoot {
            root: 9,
            prev_root: 4,
        };
        let inv = StoreTable::invert(op).unwrap();
        assert_eq!(
            inv,
            StoreOp::SetRoot {
                root: 4,
                prev_root: 9
            }
        );
        assert!(StoreTable::invert(StoreOp::DeleteStore).is_none());
    }

    #[test]
    fn test_store_op_codec() {
        let op = StoreOp::SetFlags {
            flags: 3,
            prev_flags: 1,
        };
        let bytes = op.encode();
        let mut reader = std::io::Cursor::new(bytes);
        assert_eq!(StoreOp::decode_from(&mut reader), op);
    }
}
