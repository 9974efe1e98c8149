//! In-memory row representation (SPEC_FULL §3 "Row").

use std::sync::Arc;

use crate::storage_manager::Rid;
use crate::table::descriptor::TableDescriptor;

use super::field::FieldValue;

/// An ordered array of field values, plus the record id assigned once the
/// row is known to exist on disk. Holds a shared (non-owning, in the sense
/// that many rows may point at the same schema) reference to its table's
/// descriptor, and a scratch buffer reused across `format`/`load` calls so
/// the codec's hot path avoids repeated heap churn.
#[derive(Debug, Clone)]
pub struct Row {
    pub desc: Arc<TableDescriptor>,
    pub values: Vec<FieldValue>,
    pub rid: Option<Rid>,
    pub(crate) scratch: Vec<u8>,
}

impl Row {
    pub fn new(desc: Arc<TableDescriptor>, values: Vec<FieldValue>) -> Row {
        debug_assert_eq!(values.len(), desc.fields.len());
        Row { desc, values, rid: None, scratch: Vec::new() }
    }

    pub fn is_persisted(&self) -> bool {
        self.rid.is_some()
    }

    /// Resets a row to an unpersisted, blank state so it can be handed back
    /// to the table's tuple cache for reuse (SPEC_FULL §4.9 tuple cache).
    pub fn reset(&mut self) {
        self.rid = None;
        for (value, desc) in self.values.iter_mut().zip(self.desc.fields.iter()) {
            *value = FieldValue::null_of(desc);
        }
        self.scratch.clear();
    }

    pub fn equal_values(&self, other: &Row) -> bool {
        self.values == other.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field::{FieldData, FieldDescriptor, SqlType};
    use crate::table::descriptor::TableDescriptor;

    fn desc() -> Arc<TableDescriptor> {
        Arc::new(
            TableDescriptor::new(
                "t",
                vec![
                    FieldDescriptor::new("id", SqlType::Int, 4, false),
                    FieldDescriptor::new("name", SqlType::Varchar, 16, true),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn reset_nulls_out_values_and_rid() {
        let d = desc();
        let mut row = Row::new(
            d.clone(),
            vec![
                crate::codec::field::FieldValue::new(FieldData::Int(7)),
                crate::codec::field::FieldValue::null_of(&d.fields[1]),
            ],
        );
        row.rid = Some(Rid { page_no: 1, slot: 2 });
        row.reset();
        assert!(row.rid.is_none());
        assert!(row.values[0].is_null);
    }
}
