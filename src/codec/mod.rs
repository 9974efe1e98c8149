//! The tuple/record substrate shared by the DORA core and the flusher
//! (SPEC_FULL §2 item 3): field descriptors and values, rows, and the
//! bidirectional disk-record codec.

pub mod field;
pub mod format;
pub mod row;

pub use field::{FieldData, FieldDescriptor, FieldValue, SqlType};
pub use format::{format, format_key, load, load_key, max_key, min_key};
pub use row::Row;
