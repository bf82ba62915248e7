//! Schema catalog types and the narrow lookup interface the engine consumes.
//!
//! The catalog is a read-mostly external store; the engine only ever asks it
//! for columns and labels by id. [`MemoryCatalog`] is the in-process
//! implementation used by tests and embedders; cache invalidation is the
//! owner's concern.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::model::InnerVal;

/// Typed error for schema lookups that failed because the argument does not
/// name an existing schema element. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogError(String);

impl CatalogError {
    pub fn new(message: impl Into<String>) -> Self {
        CatalogError(message.into())
    }
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Illegal argument: {}", self.0)
    }
}

impl std::error::Error for CatalogError {}

/// Value type of a column or label meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Long,
    Str,
}

impl ValueType {
    pub fn matches(self, value: &InnerVal) -> bool {
        matches!(
            (self, value),
            (ValueType::Long, InnerVal::Long(_)) | (ValueType::Str, InnerVal::Str(_))
        )
    }
}

/// Per-label write-path selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// Lock-based, linearizable per edge identity.
    Strong,
    /// Direct writes, tolerating reordering.
    Weak,
}

/// Numeric tag selecting a codec variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageVersion {
    V1,
    V2,
    V3,
}

impl StorageVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            StorageVersion::V1 => 1,
            StorageVersion::V2 => 2,
            StorageVersion::V3 => 3,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, CatalogError> {
        match v {
            1 => Ok(StorageVersion::V1),
            2 => Ok(StorageVersion::V2),
            3 => Ok(StorageVersion::V3),
            other => Err(CatalogError::new(format!("unknown schema version {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: u32,
    pub service_name: String,
    pub hbase_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceColumn {
    pub id: u32,
    pub service_id: u32,
    pub column_name: String,
    pub value_type: ValueType,
    pub schema_version: StorageVersion,
}

/// A property declared on a label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelMeta {
    pub seq: u8,
    pub name: String,
    pub value_type: ValueType,
    pub default_value: Option<InnerVal>,
}

/// A declared index: the ordered meta sequences whose values sort the
/// adjacency list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelIndex {
    pub seq: u8,
    pub meta_seqs: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: u32,
    pub label_name: String,
    pub src_column_id: u32,
    pub tgt_column_id: u32,
    pub indices: Vec<LabelIndex>,
    pub metas: Vec<LabelMeta>,
    pub consistency: ConsistencyLevel,
    pub hbase_table: String,
    pub schema_version: StorageVersion,
}

impl Label {
    pub fn is_strong(&self) -> bool {
        self.consistency == ConsistencyLevel::Strong
    }

    /// The index carrying the degree counter.
    pub fn first_index(&self) -> Result<&LabelIndex, CatalogError> {
        self.indices
            .first()
            .ok_or_else(|| CatalogError::new(format!("label {} has no indices", self.label_name)))
    }

    pub fn index(&self, seq: u8) -> Result<&LabelIndex, CatalogError> {
        self.indices.iter().find(|i| i.seq == seq).ok_or_else(|| {
            CatalogError::new(format!("label {} has no index seq {}", self.label_name, seq))
        })
    }

    pub fn meta(&self, seq: u8) -> Result<&LabelMeta, CatalogError> {
        self.metas.iter().find(|m| m.seq == seq).ok_or_else(|| {
            CatalogError::new(format!("label {} has no meta seq {}", self.label_name, seq))
        })
    }
}

/// The lookup surface the engine consumes.
pub trait SchemaCatalog: Send + Sync {
    fn find_service_column(&self, id: u32) -> Result<Arc<ServiceColumn>, CatalogError>;
    fn find_label(&self, id: u32) -> Result<Arc<Label>, CatalogError>;
}

/// DashMap-backed catalog. Registrations are expected to happen up front;
/// lookups are lock-free reads.
#[derive(Default)]
pub struct MemoryCatalog {
    services: DashMap<u32, Arc<Service>>,
    columns: DashMap<u32, Arc<ServiceColumn>>,
    labels: DashMap<u32, Arc<Label>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, service: Service) {
        self.services.insert(service.id, Arc::new(service));
    }

    pub fn add_column(&self, column: ServiceColumn) {
        self.columns.insert(column.id, Arc::new(column));
    }

    pub fn add_label(&self, label: Label) {
        self.labels.insert(label.id, Arc::new(label));
    }

    pub fn find_service(&self, id: u32) -> Result<Arc<Service>, CatalogError> {
        self.services
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CatalogError::new(format!("service {} does not exist", id)))
    }
}

impl SchemaCatalog for MemoryCatalog {
    fn find_service_column(&self, id: u32) -> Result<Arc<ServiceColumn>, CatalogError> {
        self.columns
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CatalogError::new(format!("service column {} does not exist", id)))
    }

    fn find_label(&self, id: u32) -> Result<Arc<Label>, CatalogError> {
        self.labels
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CatalogError::new(format!("label {} does not exist", id)))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_lookup_missing_label_is_illegal_argument() {
        let catalog = MemoryCatalog::new();
        let err = catalog.find_label(99).unwrap_err();
        assert!(err.to_string().contains("Illegal argument"));
    }

    #[test]
    fn test_lookup_roundtrip() {
        let catalog = catalog();
        let label = catalog.find_label(10).unwrap();
        assert_eq!(label.label_name, "friend");
        assert!(label.is_strong());

        let column = catalog.find_service_column(1).unwrap();
        assert_eq!(column.column_name, "user");
    }

    #[test]
    fn test_label_meta_and_index_lookups() {
        let label = friend_label();
        assert_eq!(label.first_index().unwrap().seq, 1);
        assert_eq!(label.meta(1).unwrap().name, "since");
        assert!(label.meta(9).is_err());
        assert!(label.index(9).is_err());
    }

    #[test]
    fn test_storage_version_roundtrip() {
        for v in [StorageVersion::V1, StorageVersion::V2, StorageVersion::V3] {
            assert_eq!(StorageVersion::from_u8(v.as_u8()).unwrap(), v);
        }
        assert!(StorageVersion::from_u8(7).is_err());
    }

    #[test]
    fn test_value_type_matches() {
        assert!(ValueType::Long.matches(&InnerVal::Long(1)));
        assert!(!ValueType::Long.matches(&InnerVal::Str("x".into())));
    }
}
