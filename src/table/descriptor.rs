//! Table and index descriptors (SPEC_FULL §3, §9 "Cyclic schema graph").
//!
//! Rather than a table owning a linked list of indexes that each hold a
//! back-pointer into the table, both live in one arena: `TableDescriptor`
//! owns a flat `Vec` of `IndexDescriptor`s, each storing its key columns as
//! plain indices into the table's field list. No back-pointer needed.

use std::sync::Mutex;

use itertools::Itertools;

use crate::codec::field::FieldDescriptor;
use crate::error::{CoreError, CoreResult};

/// An index over a subset of a table's columns.
#[derive(Debug)]
pub struct IndexDescriptor {
    pub name: String,
    /// Key columns, in key order, as indices into the owning table's
    /// `fields`.
    pub key_columns: Vec<usize>,
    pub unique: bool,
    pub primary: bool,
    /// "_NL" policy flag (SPEC_FULL §9): a no-lock variant of this index.
    pub no_lock: bool,
    cached_max_key_size: Mutex<Option<usize>>,
}

impl IndexDescriptor {
    pub fn new(
        name: impl Into<String>,
        key_columns: Vec<usize>,
        unique: bool,
        primary: bool,
        no_lock: bool,
    ) -> Self {
        IndexDescriptor {
            name: name.into(),
            key_columns,
            unique: unique || primary,
            primary,
            no_lock,
            cached_max_key_size: Mutex::new(None),
        }
    }

    pub fn max_key_size(&self, table: &TableDescriptor) -> usize {
        let mut cache = self.cached_max_key_size.lock().unwrap();
        if let Some(v) = *cache {
            return v;
        }
        let v = self.key_columns.iter().map(|&c| table.fields[c].max_size).sum();
        *cache = Some(v);
        v
    }
}

/// A table's schema: its columns plus the set of indexes built over it.
#[derive(Debug)]
pub struct TableDescriptor {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    primary_index: Option<usize>,
    cached_max_record_size: Mutex<Option<usize>>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> CoreResult<TableDescriptor> {
        Ok(TableDescriptor {
            name: name.into(),
            fields,
            indexes: Vec::new(),
            primary_index: None,
            cached_max_record_size: Mutex::new(None),
        })
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Comma-joined column names, for the shell's `INFO` output.
    pub fn column_summary(&self) -> String {
        self.fields.iter().map(|f| f.name.as_str()).join(", ")
    }

    /// Adds an index. Enforces that a variable-length key column may only
    /// be the trailing key column (SPEC_FULL §4.3 edge cases).
    pub fn create_index(
        &mut self,
        name: impl Into<String>,
        key_columns: Vec<usize>,
        unique: bool,
        primary: bool,
        no_lock: bool,
    ) -> CoreResult<usize> {
        let last = key_columns.len().saturating_sub(1);
        for (i, &col) in key_columns.iter().enumerate() {
            let f = self
                .fields
                .get(col)
                .ok_or_else(|| CoreError::IndexNotFound(format!("column index {} out of range", col)))?;
            if f.sql_type.is_variable_length() && i != last {
                return Err(CoreError::InconsistentIndex(format!(
                    "variable-length column {} must be the last key column of an index",
                    f.name
                )));
            }
        }
        if primary && self.primary_index.is_some() {
            return Err(CoreError::InconsistentIndex(
                "table already has a primary index".to_string(),
            ));
        }
        let idx = IndexDescriptor::new(name, key_columns, unique, primary, no_lock);
        let pos = self.indexes.len();
        if primary {
            self.primary_index = Some(pos);
        }
        self.indexes.push(idx);
        Ok(pos)
    }

    pub fn primary_index(&self) -> Option<&IndexDescriptor> {
        self.primary_index.map(|i| &self.indexes[i])
    }

    pub fn primary_index_pos(&self) -> Option<usize> {
        self.primary_index
    }

    /// Cached maximum on-disk size of a record of this schema (every
    /// variable-length field at its `max_size`). Computed once, then reused.
    pub fn max_record_size(&self) -> usize {
        let mut cache = self.cached_max_record_size.lock().unwrap();
        if let Some(v) = *cache {
            return v;
        }
        let nullable_count = self.fields.iter().filter(|f| f.nullable).count();
        let bitmap_bytes = (nullable_count + 7) / 8;
        let fixed_bytes: usize = self
            .fields
            .iter()
            .filter(|f| !f.sql_type.is_variable_length())
            .map(|f| f.max_size)
            .sum();
        let var_fields: Vec<_> = self.fields.iter().filter(|f| f.sql_type.is_variable_length()).collect();
        let slots_bytes = 4 * var_fields.len();
        let var_payload: usize = var_fields.iter().map(|f| f.max_size).sum();
        let v = bitmap_bytes + fixed_bytes + slots_bytes + var_payload;
        *cache = Some(v);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field::SqlType;

    #[test]
    fn rejects_variable_length_non_trailing_key_column() {
        let mut t = TableDescriptor::new(
            "t",
            vec![
                FieldDescriptor::new("a", SqlType::Varchar, 8, false),
                FieldDescriptor::new("b", SqlType::Int, 4, false),
            ],
        )
        .unwrap();
        assert!(t.create_index("bad", vec![0, 1], false, false, false).is_err());
        assert!(t.create_index("ok", vec![1, 0], false, false, false).is_ok());
    }

    #[test]
    fn only_one_primary_index_allowed() {
        let mut t = TableDescriptor::new("t", vec![FieldDescriptor::new("id", SqlType::Int, 4, false)]).unwrap();
        t.create_index("pk", vec![0], true, true, false).unwrap();
        assert!(t.create_index("pk2", vec![0], true, true, false).is_err());
    }
}
