//! Tree flavors and the per-tree bookkeeping header.
//!
//! A tree binds a flavor schema — which fields a leaf entry carries,
//! how much of it node entries repeat, whether entries carry the
//! one-word header — to the codec and comparators, and owns the
//! header-page bookkeeping: entry count, step (height), root page and
//! the two leaf-chain endpoints.

use crate::codec::{self, read_u32, write_u32, FieldType};
use crate::compare::EntryComparator;
use crate::entry::{self, EntryHeader};
use crate::error::{Error, ErrorCode, Result};
use crate::page::EntrySizer;
use crate::types::{PageId, Value, NO_PAGE, WORD_BYTES};

/// The predefined entry schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Array flavor, non-null elements: `(key, rowid, array_index)`.
    ArrayData,
    /// Array flavor, null elements: `(rowid, array_index)`.
    ArrayNullData,
    /// Array flavor, null arrays: `(rowid)`.
    ArrayNullArray,
    /// Scalar/multi-column flavor: `(k1..kn, rowid)`.
    Btree,
    /// Bitmap flavor: `(key, chain_pid)`; nodes repeat the key only.
    Bitmap,
}

impl TreeKind {
    /// Wire code used in the open-option plan prefix.
    pub fn code(self) -> u32 {
        match self {
            TreeKind::ArrayData => 0,
            TreeKind::ArrayNullData => 1,
            TreeKind::ArrayNullArray => 2,
            TreeKind::Btree => 3,
            TreeKind::Bitmap => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<TreeKind> {
        Some(match code {
            0 => TreeKind::ArrayData,
            1 => TreeKind::ArrayNullData,
            2 => TreeKind::ArrayNullArray,
            3 => TreeKind::Btree,
            4 => TreeKind::Bitmap,
            _ => return None,
        })
    }
}

/// Per-tree header persisted on the header page: five words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    pub count: u32,
    /// Height in pages from root to leaf, inclusive.
    pub step: u32,
    pub root: PageId,
    pub left_leaf: PageId,
    pub right_leaf: PageId,
}

impl TreeHeader {
    pub const SIZE_WORDS: usize = 5;

    pub fn empty() -> Self {
        TreeHeader {
            count: 0,
            step: 0,
            root: NO_PAGE,
            left_leaf: NO_PAGE,
            right_leaf: NO_PAGE,
        }
    }

    pub fn load(buf: &[u8]) -> Result<Self> {
        Ok(TreeHeader {
            count: read_u32(buf, 0)?,
            step: read_u32(buf, 4)?,
            root: read_u32(buf, 8)?,
            left_leaf: read_u32(buf, 12)?,
            right_leaf: read_u32(buf, 16)?,
        })
    }

    pub fn store(&self, buf: &mut [u8]) -> Result<()> {
        write_u32(buf, 0, self.count)?;
        write_u32(buf, 4, self.step)?;
        write_u32(buf, 8, self.root)?;
        write_u32(buf, 12, self.left_leaf)?;
        write_u32(buf, 16, self.right_leaf)
    }
}

/// Entry layout of one page class (leaf or node) of a tree.
#[derive(Debug, Clone)]
pub struct EntryLayout {
    types: Vec<FieldType>,
    has_header: bool,
}

impl EntryLayout {
    pub fn types(&self) -> &[FieldType] {
        &self.types
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }
}

impl EntrySizer for EntryLayout {
    fn entry_words(&self, buf: &[u8]) -> Result<usize> {
        entry::entry_size(buf, &self.types, self.has_header)
    }
}

pub struct Tree {
    kind: TreeKind,
    /// Bookkeeping mirrored from the header page.
    pub header: TreeHeader,
    leaf_layout: EntryLayout,
    node_layout: EntryLayout,
    /// Full-entry comparator (unique): every leaf field in order.
    comparator: EntryComparator,
    /// Leading key prefix only (non-unique): fetch and estimation.
    key_comparator: EntryComparator,
    /// How many leaf fields a node entry repeats before the child pid.
    node_prefix_count: usize,
}

impl Tree {
    fn build(
        kind: TreeKind,
        leaf_types: Vec<FieldType>,
        key_count: usize,
        node_prefix_count: usize,
        compare_count: usize,
        use_header: bool,
        top_null: bool,
    ) -> Tree {
        let mut node_types: Vec<FieldType> = leaf_types[..node_prefix_count].to_vec();
        node_types.push(FieldType::UInt32);
        let comparator = if use_header {
            EntryComparator::with_header(leaf_types[..compare_count].to_vec(), true, top_null)
        } else {
            EntryComparator::new(leaf_types[..compare_count].to_vec(), true)
        };
        let key_comparator = if use_header {
            EntryComparator::with_header(leaf_types[..key_count].to_vec(), false, top_null)
        } else {
            EntryComparator::new(leaf_types[..key_count].to_vec(), false)
        };
        Tree {
            kind,
            header: TreeHeader::empty(),
            leaf_layout: EntryLayout {
                types: leaf_types,
                has_header: use_header,
            },
            node_layout: EntryLayout {
                types: node_types,
                has_header: use_header,
            },
            comparator,
            key_comparator,
            node_prefix_count,
        }
    }

    /// Array flavor, `Data` sub-tree over element type `key`.
    pub fn array_data(key: FieldType) -> Tree {
        Tree::build(
            TreeKind::ArrayData,
            vec![key, FieldType::UInt32, FieldType::UInt32],
            1,
            3,
            3,
            false,
            true,
        )
    }

    /// Array flavor, `NullData` sub-tree.
    pub fn array_null_data() -> Tree {
        Tree::build(
            TreeKind::ArrayNullData,
            vec![FieldType::UInt32, FieldType::UInt32],
            1,
            2,
            2,
            false,
            true,
        )
    }

    /// Array flavor, `NullArray` sub-tree.
    pub fn array_null_array() -> Tree {
        Tree::build(
            TreeKind::ArrayNullArray,
            vec![FieldType::UInt32],
            1,
            1,
            1,
            false,
            true,
        )
    }

    /// Scalar flavor: `keys` then the trailing rowid.
    pub fn btree(keys: Vec<FieldType>, use_header: bool, top_null: bool) -> Tree {
        let key_count = keys.len();
        let mut leaf_types = keys;
        leaf_types.push(FieldType::UInt32);
        let prefix = leaf_types.len();
        Tree::build(
            TreeKind::Btree,
            leaf_types,
            key_count,
            prefix,
            prefix,
            use_header,
            top_null,
        )
    }

    /// Bitmap flavor: key plus the bitmap-chain head page id.
    pub fn bitmap(key: FieldType) -> Tree {
        // Keys alone decide uniqueness: the chain pointer is payload.
        Tree::build(
            TreeKind::Bitmap,
            vec![key, FieldType::UInt32],
            1,
            1,
            1,
            false,
            true,
        )
    }

    pub fn kind(&self) -> TreeKind {
        self.kind
    }

    pub fn comparator(&self) -> &EntryComparator {
        &self.comparator
    }

    pub fn key_comparator(&self) -> &EntryComparator {
        &self.key_comparator
    }

    pub fn leaf_layout(&self) -> &EntryLayout {
        &self.leaf_layout
    }

    pub fn node_layout(&self) -> &EntryLayout {
        &self.node_layout
    }

    /// Sizer for whichever class `leaf` says.
    pub fn layout_for(&self, leaf: bool) -> &EntryLayout {
        if leaf {
            &self.leaf_layout
        } else {
            &self.node_layout
        }
    }

    pub fn uses_header(&self) -> bool {
        self.leaf_layout.has_header
    }

    // ------------------------------------------------------------------
    // Entry construction
    // ------------------------------------------------------------------

    /// Pack `values` into a leaf entry. Null values require the header;
    /// without it they are a nullability violation.
    pub fn make_leaf_entry(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.leaf_layout.types.len() {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        let mut out = Vec::new();
        if self.leaf_layout.has_header {
            let mut header = EntryHeader::new();
            for (n, v) in values.iter().enumerate() {
                if v.is_null() {
                    if n >= entry::MAX_NULLABLE_FIELDS {
                        return Err(Error::new(ErrorCode::NullabilityViolation));
                    }
                    header.set_null(n, true);
                }
            }
            header.write(&mut out);
        }
        for (v, &ty) in values.iter().zip(&self.leaf_layout.types) {
            if v.is_null() {
                if !self.leaf_layout.has_header {
                    return Err(Error::new(ErrorCode::NullabilityViolation));
                }
                continue;
            }
            codec::dump(&mut out, v, ty)?;
        }
        if out.len() / WORD_BYTES > crate::fileid::MAX_ENTRY_WORDS {
            return Err(Error::new(ErrorCode::BadArgument));
        }
        Ok(out)
    }

    /// Build the node entry delegating to `child`: the child's smallest
    /// entry's sort prefix with the child page id appended.
    pub fn make_node_entry(&self, child_begin: &[u8], child: PageId) -> Result<Vec<u8>> {
        let prefix_bytes = self.node_prefix_bytes(child_begin)?;
        let mut out = child_begin[..prefix_bytes].to_vec();
        out.extend_from_slice(&child.to_le_bytes());
        Ok(out)
    }

    fn node_prefix_bytes(&self, leaf_entry: &[u8]) -> Result<usize> {
        let offsets = entry::field_offsets(
            leaf_entry,
            &self.leaf_layout.types,
            self.leaf_layout.has_header,
        )?;
        let mut end = if self.leaf_layout.has_header {
            EntryHeader::SIZE_WORDS * WORD_BYTES
        } else {
            0
        };
        for (n, off) in offsets.iter().enumerate().take(self.node_prefix_count) {
            if let Some(at) = off {
                let w = codec::size_from_buffer(&leaf_entry[*at..], self.leaf_layout.types[n])?;
                end = *at + w * WORD_BYTES;
            }
        }
        Ok(end)
    }

    /// Child page id stored in the trailing field of a node entry.
    pub fn page_id_of(&self, node_entry: &[u8]) -> Result<PageId> {
        if node_entry.len() < WORD_BYTES {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        read_u32(node_entry, node_entry.len() - WORD_BYTES)
    }

    // ------------------------------------------------------------------
    // Estimation support
    // ------------------------------------------------------------------

    /// Average entries contributed per tuple, used to convert an entry
    /// estimate into a tuple estimate.
    pub fn average_entry_count(&self, tuple_count: u32, one_entry_tuple_count: u32) -> f64 {
        match self.kind {
            TreeKind::ArrayNullArray | TreeKind::Btree | TreeKind::Bitmap => 1.0,
            TreeKind::ArrayData | TreeKind::ArrayNullData => {
                let denom = tuple_count.saturating_sub(one_entry_tuple_count);
                if denom == 0 || self.header.count == 0 {
                    1.0
                } else {
                    f64::from(self.header.count) / f64::from(denom)
                }
            }
        }
    }
}
