//! The record codec: bidirectional translation between in-memory rows and
//! the on-disk byte layout of SPEC_FULL §4.2:
//!
//! ```text
//! [null bitmap][fixed area][offset slots][variable payloads]
//! ```

use std::convert::TryInto;

use bit_vec::BitVec;

use crate::error::{CoreError, CoreResult};
use crate::table::descriptor::{IndexDescriptor, TableDescriptor};

use super::field::{FieldData, FieldValue};
use super::row::Row;

const OFFSET_SLOT_WIDTH: usize = 4;

fn bitmap_bytes(desc: &TableDescriptor) -> usize {
    let nullable_count = desc.fields.iter().filter(|f| f.nullable).count();
    (nullable_count + 7) / 8
}

fn fixed_area_bytes(desc: &TableDescriptor) -> usize {
    desc.fields
        .iter()
        .filter(|f| !f.sql_type.is_variable_length())
        .map(|f| f.max_size)
        .sum()
}

fn variable_columns(desc: &TableDescriptor) -> Vec<usize> {
    desc.fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.sql_type.is_variable_length())
        .map(|(i, _)| i)
        .collect()
}

/// Serializes a row into its on-disk byte image. See SPEC_FULL §4.2. A null
/// variable-length column contributes nothing: no offset slot, no payload
/// bytes, matching the original's `table_row_t::size()` skipping every byte
/// contribution (slot included) for a null nullable field.
pub fn format(row: &Row) -> CoreResult<Vec<u8>> {
    let desc = &row.desc;
    let bitmap_bytes = bitmap_bytes(desc);
    let fixed_bytes = fixed_area_bytes(desc);
    let var_cols = variable_columns(desc);
    let present_var_cols: Vec<usize> = var_cols.iter().copied().filter(|&i| !row.values[i].is_null).collect();
    let slots_bytes = OFFSET_SLOT_WIDTH * present_var_cols.len();

    let mut payload_bytes = 0usize;
    for &i in &present_var_cols {
        payload_bytes += row.values[i].real_size(&desc.fields[i]);
    }

    let total = bitmap_bytes + fixed_bytes + slots_bytes + payload_bytes;
    let mut buf = vec![0u8; total];

    // null bitmap: indexed by nullable-column order, not overall column order.
    let mut bv = BitVec::from_elem(bitmap_bytes * 8, false);
    let mut null_index = 0usize;
    for (i, f) in desc.fields.iter().enumerate() {
        if f.nullable {
            if row.values[i].is_null {
                bv.set(null_index, true);
            }
            null_index += 1;
        }
    }
    buf[..bitmap_bytes].copy_from_slice(&bv.to_bytes());

    // fixed area, written unconditionally even for null fixed-length columns.
    let mut fixed_off = bitmap_bytes;
    for (i, f) in desc.fields.iter().enumerate() {
        if !f.sql_type.is_variable_length() {
            row.values[i].write_fixed_image(f, &mut buf[fixed_off..fixed_off + f.max_size])?;
            fixed_off += f.max_size;
        }
    }

    // offset slots + variable payloads, column order, null columns skipped entirely.
    let slots_off = bitmap_bytes + fixed_bytes;
    let payload_start = slots_off + slots_bytes;
    let mut payload_off = payload_start;
    for (slot_idx, &i) in present_var_cols.iter().enumerate() {
        let f = &desc.fields[i];
        let len = row.values[i].real_size(f);
        let slot_pos = slots_off + slot_idx * OFFSET_SLOT_WIDTH;
        buf[slot_pos..slot_pos + OFFSET_SLOT_WIDTH].copy_from_slice(&(len as u32).to_le_bytes());
        if let FieldData::Varchar(v) = &row.values[i].data {
            buf[payload_off..payload_off + len].copy_from_slice(&v[..len]);
        }
        payload_off += len;
    }

    Ok(buf)
}

/// Deserializes a byte image into a fresh row bound to `desc`. Inverse of
/// `format`; `load(format(r)) == r` componentwise (SPEC_FULL §8). A null
/// variable-length column has no offset slot and no payload bytes, so the
/// bitmap is read first to know which variable columns are present before
/// the slot area can be walked.
pub fn load(desc: &std::sync::Arc<TableDescriptor>, buf: &[u8]) -> CoreResult<Row> {
    let bitmap_bytes_n = bitmap_bytes(desc);
    let fixed_bytes = fixed_area_bytes(desc);
    let var_cols = variable_columns(desc);

    if buf.len() < bitmap_bytes_n + fixed_bytes {
        return Err(CoreError::WrongDiskData(format!(
            "record too short: {} bytes, need at least {}",
            buf.len(),
            bitmap_bytes_n + fixed_bytes
        )));
    }

    let bv = BitVec::from_bytes(&buf[..bitmap_bytes_n]);
    let mut null_flags = vec![false; desc.fields.len()];
    let mut null_index = 0usize;
    for (i, f) in desc.fields.iter().enumerate() {
        if f.nullable {
            null_flags[i] = bv.get(null_index).unwrap_or(false);
            null_index += 1;
        }
    }

    let present_var_cols: Vec<usize> = var_cols.iter().copied().filter(|&i| !null_flags[i]).collect();
    let slots_bytes = OFFSET_SLOT_WIDTH * present_var_cols.len();
    let header_len = bitmap_bytes_n + fixed_bytes + slots_bytes;

    if buf.len() < header_len {
        return Err(CoreError::WrongDiskData(format!(
            "record too short: {} bytes, need at least {}",
            buf.len(),
            header_len
        )));
    }

    let slots_off = bitmap_bytes_n + fixed_bytes;
    let mut var_lens = std::collections::HashMap::with_capacity(present_var_cols.len());
    for (k, &i) in present_var_cols.iter().enumerate() {
        let p = slots_off + k * OFFSET_SLOT_WIDTH;
        let len = u32::from_le_bytes(buf[p..p + OFFSET_SLOT_WIDTH].try_into().unwrap()) as usize;
        var_lens.insert(i, len);
    }

    let payload_start = header_len;
    let total_expected = payload_start + var_lens.values().sum::<usize>();
    if buf.len() != total_expected {
        return Err(CoreError::WrongDiskData(format!(
            "record size mismatch: {} bytes, expected {}",
            buf.len(),
            total_expected
        )));
    }

    let mut values = Vec::with_capacity(desc.fields.len());
    let mut fixed_off = bitmap_bytes_n;
    let mut payload_off = payload_start;

    for (i, f) in desc.fields.iter().enumerate() {
        let mut value = if f.sql_type.is_variable_length() {
            match var_lens.get(&i) {
                Some(&len) => {
                    let payload = &buf[payload_off..payload_off + len];
                    payload_off += len;
                    FieldValue::new(FieldData::Varchar(payload.to_vec()))
                }
                None => FieldValue::null_of(f),
            }
        } else {
            let image = &buf[fixed_off..fixed_off + f.max_size];
            fixed_off += f.max_size;
            FieldValue::read_fixed_image(f, image)?
        };
        if f.nullable && null_flags[i] {
            value.is_null = true;
        }
        values.push(value);
    }

    Ok(Row::new(desc.clone(), values))
}

fn keysize(desc: &TableDescriptor, index: &IndexDescriptor) -> usize {
    index.key_columns.iter().map(|&c| desc.fields[c].max_size).sum()
}

/// Formats the key image for `index` out of `values` (column order is the
/// index's key-column order; every key column contributes a `max_size`-wide
/// image, including variable-length ones).
fn format_key_from_values(
    desc: &TableDescriptor,
    index: &IndexDescriptor,
    values: &[FieldValue],
) -> CoreResult<Vec<u8>> {
    let size = keysize(desc, index);
    let mut buf = vec![0u8; size];
    let mut off = 0;
    for &col in &index.key_columns {
        let f = &desc.fields[col];
        if values[col].is_null {
            return Err(CoreError::InconsistentIndex(format!(
                "index {}: NULL values are not supported in key column {}",
                index.name, f.name
            )));
        }
        values[col].write_fixed_image(f, &mut buf[off..off + f.max_size])?;
        off += f.max_size;
    }
    Ok(buf)
}

/// `format_key(index, row) -> buf`, SPEC_FULL §4.2.
pub fn format_key(desc: &TableDescriptor, index: &IndexDescriptor, row: &Row) -> CoreResult<Vec<u8>> {
    format_key_from_values(desc, index, &row.values)
}

/// Smallest possible key image for `index`: every key column set to its
/// type-specific minimum.
pub fn min_key(desc: &TableDescriptor, index: &IndexDescriptor) -> Vec<u8> {
    let values: Vec<FieldValue> = desc.fields.iter().map(FieldValue::min_of).collect();
    format_key_from_values(desc, index, &values).expect("min values are never null")
}

/// Largest possible key image for `index`: every key column set to its
/// type-specific maximum.
pub fn max_key(desc: &TableDescriptor, index: &IndexDescriptor) -> Vec<u8> {
    let values: Vec<FieldValue> = desc.fields.iter().map(FieldValue::max_of).collect();
    format_key_from_values(desc, index, &values).expect("max values are never null")
}

/// Inverse of `format_key`: reconstructs the key-column values from a key
/// image, each key column consuming exactly `max_size` bytes.
pub fn load_key(desc: &TableDescriptor, index: &IndexDescriptor, buf: &[u8]) -> CoreResult<Vec<FieldValue>> {
    if buf.len() != keysize(desc, index) {
        return Err(CoreError::WrongDiskData(format!(
            "key image for {}: expected {} bytes, got {}",
            index.name,
            keysize(desc, index),
            buf.len()
        )));
    }
    let mut values = Vec::with_capacity(index.key_columns.len());
    let mut off = 0;
    for &col in &index.key_columns {
        let f = &desc.fields[col];
        values.push(FieldValue::read_fixed_image(f, &buf[off..off + f.max_size])?);
        off += f.max_size;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field::SqlType;
    use crate::table::descriptor::TableDescriptor;
    use crate::codec::field::FieldDescriptor;
    use std::sync::Arc;

    fn schema() -> Arc<TableDescriptor> {
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
    fn roundtrip_non_null() {
        let desc = schema();
        let row = Row::new(
            desc.clone(),
            vec![
                FieldValue::new(FieldData::Int(1)),
                FieldValue::new(FieldData::Varchar(b"Alice".to_vec())),
            ],
        );
        let buf = format(&row).unwrap();
        let loaded = load(&desc, &buf).unwrap();
        assert!(row.equal_values(&loaded));
    }

    #[test]
    fn roundtrip_with_null() {
        let desc = schema();
        let mut row = Row::new(
            desc.clone(),
            vec![
                FieldValue::new(FieldData::Int(7)),
                FieldValue::null_of(&desc.fields[1]),
            ],
        );
        row.values[1].is_null = true;
        let buf = format(&row).unwrap();
        // ceil(1/8) + 4 (fixed int) + 0: a null varchar contributes no
        // offset slot and no payload bytes.
        assert_eq!(buf.len(), 1 + 4 + 0);
        let loaded = load(&desc, &buf).unwrap();
        assert!(loaded.values[1].is_null);
    }

    #[test]
    fn roundtrip_max_length_varchar() {
        let desc = schema();
        let row = Row::new(
            desc.clone(),
            vec![
                FieldValue::new(FieldData::Int(-99)),
                FieldValue::new(FieldData::Varchar(vec![b'x'; 16])),
            ],
        );
        let buf = format(&row).unwrap();
        let loaded = load(&desc, &buf).unwrap();
        assert!(row.equal_values(&loaded));
    }

    #[test]
    fn key_ordering_brackets_any_row() {
        let desc = schema();
        let index = IndexDescriptor::new("pk_id", vec![0], true, true, false);
        let row = Row::new(
            desc.clone(),
            vec![FieldValue::new(FieldData::Int(42)), FieldValue::null_of(&desc.fields[1])],
        );
        let lo = min_key(&desc, &index);
        let hi = max_key(&desc, &index);
        let mid = format_key(&desc, &index, &row).unwrap();
        assert_eq!(mid.len(), keysize(&desc, &index));
        assert!(lo < mid);
        assert!(mid < hi);
    }

    #[test]
    fn format_key_rejects_null_key_column() {
        let desc = schema();
        let index = IndexDescriptor::new("by_name", vec![1], false, false, false);
        let row = Row::new(
            desc.clone(),
            vec![FieldValue::new(FieldData::Int(1)), FieldValue::null_of(&desc.fields[1])],
        );
        assert!(format_key(&desc, &index, &row).is_err());
    }
}
