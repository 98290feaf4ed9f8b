//! Lockable, versioned resources.

use bytes::Bytes;
use std::fmt;

/// Payload stored for a resource. The core never interprets it.
pub type Value = Bytes;

/// Identifies a resource that can be locked and versioned.
///
/// Resources form a two-level hierarchy: tables contain pages and rows.
/// Intention locks are taken on a table before its rows or pages are locked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceId {
    /// A table-level resource.
    Table(u64),
    /// A page inside a table (table_id, page_no).
    Page(u64, u64),
    /// A row inside a table (table_id, row_key).
    Row(u64, Bytes),
}

impl ResourceId {
    /// Creates a table resource ID.
    #[must_use]
    pub fn table(table_id: u64) -> Self {
        ResourceId::Table(table_id)
    }

    /// Creates a page resource ID.
    #[must_use]
    pub fn page(table_id: u64, page_no: u64) -> Self {
        ResourceId::Page(table_id, page_no)
    }

    /// Creates a row resource ID.
    #[must_use]
    pub fn row(table_id: u64, key: impl Into<Bytes>) -> Self {
        ResourceId::Row(table_id, key.into())
    }

    /// Returns the table this resource belongs to.
    #[must_use]
    pub fn table_id(&self) -> u64 {
        match self {
            ResourceId::Table(id) | ResourceId::Page(id, _) | ResourceId::Row(id, _) => *id,
        }
    }

    /// Returns the enclosing resource, if any.
    #[must_use]
    pub fn parent(&self) -> Option<ResourceId> {
        match self {
            ResourceId::Table(_) => None,
            ResourceId::Page(id, _) | ResourceId::Row(id, _) => Some(ResourceId::Table(*id)),
        }
    }

    /// Returns true for table-level resources.
    #[must_use]
    pub fn is_table(&self) -> bool {
        matches!(self, ResourceId::Table(_))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Table(id) => write!(f, "table:{}", id),
            ResourceId::Page(table, page) => write!(f, "page:{}/{}", table, page),
            ResourceId::Row(table, key) => match std::str::from_utf8(key) {
                Ok(text) => write!(f, "row:{}/{}", table, text),
                Err(_) => write!(f, "row:{}/{:?}", table, key),
            },
        }
    }
}
