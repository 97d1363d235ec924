//! De-duplicated, retrieval-ordered collection of feature records.

use hashbrown::HashMap;

use super::feature::{FeatureId, FeatureRecord};

/// Records accumulated by one run.
///
/// Records keep the position at which their identifier was first seen. A
/// later record with the same identifier replaces the earlier one (last
/// page wins), so a retried offset window never grows the set.
#[derive(Debug, Default)]
pub struct ResultSet {
    records: Vec<FeatureRecord>,
    index: HashMap<FeatureId, usize>,
    duplicates: usize,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Returns `true` if the identifier was new.
    pub fn insert(&mut self, record: FeatureRecord) -> bool {
        if let Some(&pos) = self.index.get(&record.id) {
            self.records[pos] = record;
            self.duplicates += 1;
            false
        } else {
            self.index.insert(record.id.clone(), self.records.len());
            self.records.push(record);
            true
        }
    }

    /// Insert every record of a page, returning how many were new
    pub fn extend<I: IntoIterator<Item = FeatureRecord>>(&mut self, records: I) -> usize {
        let mut added = 0;
        for record in records {
            if self.insert(record) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of inserts that replaced an existing identifier
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn contains(&self, id: &FeatureId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &FeatureId) -> Option<&FeatureRecord> {
        self.index.get(id).map(|&pos| &self.records[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureRecord> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<FeatureRecord> {
        self.records
    }
}
