//! Field descriptors and typed field values (SPEC_FULL §3, §9 "Variant row
//! types by sql-type").
//!
//! The kit this crate is descended from modeled a field value as a tagged
//! union keyed by `sql_type`. We replace that with a plain Rust sum type
//! (`FieldData`) plus a separate `is_null` flag, matched on throughout the
//! codec instead of switched on a type tag.

use crate::error::{CoreError, CoreResult};

/// SQL scalar types a table column may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Smallint,
    Int,
    Float,
    Time,
    Varchar,
    Char,
    Numeric,
    SNumeric,
}

impl SqlType {
    /// Only `VARCHAR` is variable-length; every other type occupies exactly
    /// `max_size` bytes in the fixed area regardless of the value it holds.
    pub fn is_variable_length(self) -> bool {
        matches!(self, SqlType::Varchar)
    }

    /// Natural on-the-wire width for scalar numeric types; `None` for the
    /// byte-blob types whose width is schema-defined (`max_size`).
    fn natural_width(self) -> Option<usize> {
        match self {
            SqlType::Smallint => Some(2),
            SqlType::Int => Some(4),
            SqlType::Float => Some(8),
            SqlType::Time => Some(8),
            _ => None,
        }
    }
}

/// Immutable column metadata, bound once when a table's schema is created.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub sql_type: SqlType,
    pub max_size: usize,
    pub nullable: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, sql_type: SqlType, max_size: usize, nullable: bool) -> Self {
        let max_size = sql_type.natural_width().unwrap_or(max_size);
        FieldDescriptor {
            name: name.into(),
            sql_type,
            max_size,
            nullable,
        }
    }
}

/// The typed payload of a field value. `Char`/`Numeric`/`SNumeric` are boxed
/// slices because their width is schema-fixed (`max_size`) even though it is
/// only known at runtime; `Varchar` is the sole variable-length carrier.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    Smallint(i16),
    Int(i32),
    Float(f64),
    Time(i64),
    Char(Box<[u8]>),
    Varchar(Vec<u8>),
    Numeric(Box<[u8]>),
    SNumeric(Box<[u8]>),
}

/// A field value: a typed payload plus a null flag. For fixed-length types
/// the payload's width still equals `desc.max_size` even when `is_null` is
/// set (§3: "still consumes its fixed-area bytes if it is fixed-length, but
/// its value is undefined").
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub data: FieldData,
    pub is_null: bool,
}

impl FieldValue {
    pub fn new(data: FieldData) -> Self {
        FieldValue { data, is_null: false }
    }

    /// Builds a placeholder NULL value of the descriptor's type. Callers
    /// must have already checked `desc.nullable`.
    pub fn null_of(desc: &FieldDescriptor) -> Self {
        let data = match desc.sql_type {
            SqlType::Smallint => FieldData::Smallint(0),
            SqlType::Int => FieldData::Int(0),
            SqlType::Float => FieldData::Float(0.0),
            SqlType::Time => FieldData::Time(0),
            SqlType::Char => FieldData::Char(vec![0u8; desc.max_size].into_boxed_slice()),
            SqlType::Varchar => FieldData::Varchar(Vec::new()),
            SqlType::Numeric => FieldData::Numeric(vec![0u8; desc.max_size].into_boxed_slice()),
            SqlType::SNumeric => FieldData::SNumeric(vec![0u8; desc.max_size].into_boxed_slice()),
        };
        FieldValue { data, is_null: true }
    }

    /// The type-specific minimum value, used to build `min_key` images.
    pub fn min_of(desc: &FieldDescriptor) -> Self {
        let data = match desc.sql_type {
            SqlType::Smallint => FieldData::Smallint(i16::MIN),
            SqlType::Int => FieldData::Int(i32::MIN),
            SqlType::Float => FieldData::Float(f64::MIN),
            SqlType::Time => FieldData::Time(i64::MIN),
            SqlType::Char => FieldData::Char(vec![0u8; desc.max_size].into_boxed_slice()),
            SqlType::Varchar => FieldData::Varchar(Vec::new()),
            SqlType::Numeric => FieldData::Numeric(vec![b'0'; desc.max_size].into_boxed_slice()),
            SqlType::SNumeric => FieldData::SNumeric(vec![b'0'; desc.max_size].into_boxed_slice()),
        };
        FieldValue { data, is_null: false }
    }

    /// The type-specific maximum value, used to build `max_key` images
    /// ("max int, all-'z' for CHAR, all-'9' for NUMERIC" per §4.2).
    pub fn max_of(desc: &FieldDescriptor) -> Self {
        let data = match desc.sql_type {
            SqlType::Smallint => FieldData::Smallint(i16::MAX),
            SqlType::Int => FieldData::Int(i32::MAX),
            SqlType::Float => FieldData::Float(f64::MAX),
            SqlType::Time => FieldData::Time(i64::MAX),
            SqlType::Char => FieldData::Char(vec![b'z'; desc.max_size].into_boxed_slice()),
            SqlType::Varchar => FieldData::Varchar(vec![0xffu8; desc.max_size]),
            SqlType::Numeric => FieldData::Numeric(vec![b'9'; desc.max_size].into_boxed_slice()),
            SqlType::SNumeric => FieldData::SNumeric(vec![b'9'; desc.max_size].into_boxed_slice()),
        };
        FieldValue { data, is_null: false }
    }

    /// Bytes actually occupied in the variable area; 0 for NULL varchars,
    /// `desc.max_size` for every fixed-length type.
    pub fn real_size(&self, desc: &FieldDescriptor) -> usize {
        if self.is_null && desc.sql_type.is_variable_length() {
            return 0;
        }
        match &self.data {
            FieldData::Varchar(v) => v.len(),
            _ => desc.max_size,
        }
    }

    /// Serializes this value's fixed-width image into `out` (which must be
    /// exactly `desc.max_size` bytes), used both by the fixed area of
    /// `format` and by `format_key`.
    pub fn write_fixed_image(&self, desc: &FieldDescriptor, out: &mut [u8]) -> CoreResult<()> {
        if out.len() != desc.max_size {
            return Err(CoreError::WrongDiskData(format!(
                "field {}: expected {} byte image, got {}",
                desc.name,
                desc.max_size,
                out.len()
            )));
        }
        match &self.data {
            FieldData::Smallint(v) => {
                let biased = (*v as u16) ^ 0x8000;
                out.copy_from_slice(&biased.to_be_bytes());
            }
            FieldData::Int(v) => {
                let biased = (*v as u32) ^ 0x8000_0000;
                out.copy_from_slice(&biased.to_be_bytes());
            }
            FieldData::Time(v) => {
                let biased = (*v as u64) ^ 0x8000_0000_0000_0000;
                out.copy_from_slice(&biased.to_be_bytes());
            }
            FieldData::Float(v) => {
                let bits = v.to_bits();
                let monotone = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
                out.copy_from_slice(&monotone.to_be_bytes());
            }
            FieldData::Char(b) | FieldData::Numeric(b) | FieldData::SNumeric(b) => {
                let n = b.len().min(out.len());
                out[..n].copy_from_slice(&b[..n]);
                for slot in out.iter_mut().skip(n) {
                    *slot = 0;
                }
            }
            FieldData::Varchar(v) => {
                let n = v.len().min(out.len());
                out[..n].copy_from_slice(&v[..n]);
                for slot in out.iter_mut().skip(n) {
                    *slot = 0;
                }
            }
        }
        Ok(())
    }

    /// Inverse of `write_fixed_image`: reconstructs a value from its
    /// fixed-width on-disk image.
    pub fn read_fixed_image(desc: &FieldDescriptor, image: &[u8]) -> CoreResult<FieldValue> {
        if image.len() != desc.max_size {
            return Err(CoreError::WrongDiskData(format!(
                "field {}: expected {} byte image, got {}",
                desc.name,
                desc.max_size,
                image.len()
            )));
        }
        let data = match desc.sql_type {
            SqlType::Smallint => {
                let biased = u16::from_be_bytes(image.try_into().unwrap());
                FieldData::Smallint((biased ^ 0x8000) as i16)
            }
            SqlType::Int => {
                let biased = u32::from_be_bytes(image.try_into().unwrap());
                FieldData::Int((biased ^ 0x8000_0000) as i32)
            }
            SqlType::Time => {
                let biased = u64::from_be_bytes(image.try_into().unwrap());
                FieldData::Time((biased ^ 0x8000_0000_0000_0000) as i64)
            }
            SqlType::Float => {
                let monotone = u64::from_be_bytes(image.try_into().unwrap());
                let bits = if monotone & (1 << 63) != 0 {
                    monotone & !(1 << 63)
                } else {
                    !monotone
                };
                FieldData::Float(f64::from_bits(bits))
            }
            SqlType::Char => FieldData::Char(image.to_vec().into_boxed_slice()),
            SqlType::Numeric => FieldData::Numeric(image.to_vec().into_boxed_slice()),
            SqlType::SNumeric => FieldData::SNumeric(image.to_vec().into_boxed_slice()),
            SqlType::Varchar => FieldData::Varchar(image.to_vec()),
        };
        Ok(FieldValue { data, is_null: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_desc() -> FieldDescriptor {
        FieldDescriptor::new("id", SqlType::Int, 4, false)
    }

    #[test]
    fn fixed_image_roundtrip_preserves_ordering() {
        let desc = int_desc();
        let lo = FieldValue::new(FieldData::Int(-5));
        let hi = FieldValue::new(FieldData::Int(5));
        let mut lo_buf = [0u8; 4];
        let mut hi_buf = [0u8; 4];
        lo.write_fixed_image(&desc, &mut lo_buf).unwrap();
        hi.write_fixed_image(&desc, &mut hi_buf).unwrap();
        assert!(lo_buf < hi_buf);
        assert_eq!(FieldValue::read_fixed_image(&desc, &lo_buf).unwrap(), lo);
    }

    #[test]
    fn min_max_bracket_any_value() {
        let desc = int_desc();
        let min = FieldValue::min_of(&desc);
        let max = FieldValue::max_of(&desc);
        let mid = FieldValue::new(FieldData::Int(42));
        let mut min_buf = [0u8; 4];
        let mut max_buf = [0u8; 4];
        let mut mid_buf = [0u8; 4];
        min.write_fixed_image(&desc, &mut min_buf).unwrap();
        max.write_fixed_image(&desc, &mut max_buf).unwrap();
        mid.write_fixed_image(&desc, &mut mid_buf).unwrap();
        assert!(min_buf < mid_buf);
        assert!(mid_buf < max_buf);
    }

    #[test]
    fn real_size_zero_for_null_varchar() {
        let desc = FieldDescriptor::new("name", SqlType::Varchar, 16, true);
        let v = FieldValue::null_of(&desc);
        assert_eq!(v.real_size(&desc), 0);
    }

    proptest::proptest! {
        /// Any two ints' fixed-width images compare in the same order as the
        /// ints themselves, for every value `i32` can take — the property
        /// the index's bit-lexicographic range scan depends on.
        #[test]
        fn int_images_preserve_ordering(a: i32, b: i32) {
            let desc = int_desc();
            let mut a_buf = [0u8; 4];
            let mut b_buf = [0u8; 4];
            FieldValue::new(FieldData::Int(a)).write_fixed_image(&desc, &mut a_buf).unwrap();
            FieldValue::new(FieldData::Int(b)).write_fixed_image(&desc, &mut b_buf).unwrap();
            proptest::prop_assert_eq!(a.cmp(&b), a_buf.cmp(&b_buf));
        }

        /// Same property for floats, whose monotone bit-twiddle only
        /// preserves order for non-NaN values.
        #[test]
        fn float_images_preserve_ordering(a in -1e12f64..1e12, b in -1e12f64..1e12) {
            let desc = FieldDescriptor::new("f", SqlType::Float, 8, false);
            let mut a_buf = [0u8; 8];
            let mut b_buf = [0u8; 8];
            FieldValue::new(FieldData::Float(a)).write_fixed_image(&desc, &mut a_buf).unwrap();
            FieldValue::new(FieldData::Float(b)).write_fixed_image(&desc, &mut b_buf).unwrap();
            proptest::prop_assert_eq!(a.partial_cmp(&b).unwrap(), a_buf.cmp(&b_buf));
        }
    }
}
