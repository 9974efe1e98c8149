//! Pipe-delimited bulk-load line parser (SPEC_FULL §6.3): one record per
//! line, fields separated by a single delimiter byte (default `|`), a
//! literal `(null)` token for NULL (only on nullable columns), and optional
//! `"..."` quoting around a field's text.

use crate::codec::field::{FieldData, FieldValue, SqlType};
use crate::codec::row::Row;
use crate::error::{CoreError, CoreResult};
use crate::table::descriptor::TableDescriptor;
use std::sync::Arc;

pub const DEFAULT_DELIMITER: u8 = b'|';
const NULL_TOKEN: &str = "(null)";

/// Splits `line` into raw field tokens on `delimiter`, honoring `"..."`
/// quoting (a quoted field may itself contain the delimiter byte).
fn split_fields(line: &str, delimiter: u8) -> Vec<String> {
    let delimiter = delimiter as char;
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            in_quotes = !in_quotes;
            continue;
        }
        if c == delimiter && !in_quotes {
            fields.push(std::mem::take(&mut current));
            continue;
        }
        current.push(c);
    }
    fields.push(current);
    fields
}

fn parse_field(token: &str, desc: &crate::codec::field::FieldDescriptor) -> CoreResult<FieldValue> {
    if token == NULL_TOKEN {
        if !desc.nullable {
            return Err(CoreError::WrongDiskData(format!(
                "field {}: (null) token on a non-nullable column",
                desc.name
            )));
        }
        return Ok(FieldValue::null_of(desc));
    }
    let data = match desc.sql_type {
        SqlType::Smallint => FieldData::Smallint(token.trim().parse().map_err(|_| {
            CoreError::WrongDiskData(format!("field {}: bad smallint {:?}", desc.name, token))
        })?),
        SqlType::Int => FieldData::Int(token.trim().parse().map_err(|_| {
            CoreError::WrongDiskData(format!("field {}: bad int {:?}", desc.name, token))
        })?),
        SqlType::Float => FieldData::Float(token.trim().parse().map_err(|_| {
            CoreError::WrongDiskData(format!("field {}: bad float {:?}", desc.name, token))
        })?),
        SqlType::Time => FieldData::Time(token.trim().parse().map_err(|_| {
            CoreError::WrongDiskData(format!("field {}: bad time {:?}", desc.name, token))
        })?),
        SqlType::Varchar => {
            let bytes = token.as_bytes();
            if bytes.len() > desc.max_size {
                return Err(CoreError::WrongDiskData(format!(
                    "field {}: value of {} bytes exceeds max_size {}",
                    desc.name,
                    bytes.len(),
                    desc.max_size
                )));
            }
            FieldData::Varchar(bytes.to_vec())
        }
        SqlType::Char | SqlType::Numeric | SqlType::SNumeric => {
            let bytes = token.as_bytes();
            if bytes.len() > desc.max_size {
                return Err(CoreError::WrongDiskData(format!(
                    "field {}: value of {} bytes exceeds max_size {}",
                    desc.name,
                    bytes.len(),
                    desc.max_size
                )));
            }
            let mut padded = vec![0u8; desc.max_size];
            padded[..bytes.len()].copy_from_slice(bytes);
            match desc.sql_type {
                SqlType::Char => FieldData::Char(padded.into_boxed_slice()),
                SqlType::Numeric => FieldData::Numeric(padded.into_boxed_slice()),
                _ => FieldData::SNumeric(padded.into_boxed_slice()),
            }
        }
    };
    Ok(FieldValue::new(data))
}

/// Parses one bulk-load line into a `Row` bound to `desc`. `line_limit`
/// enforces the bounded-line-buffer rule (`TerminatedBuffer` past it).
pub fn parse_line(
    line: &str,
    desc: &Arc<TableDescriptor>,
    delimiter: u8,
    line_limit: usize,
) -> CoreResult<Row> {
    if line.len() > line_limit {
        return Err(CoreError::TerminatedBuffer);
    }
    let tokens = split_fields(line, delimiter);
    if tokens.len() != desc.fields.len() {
        return Err(CoreError::WrongDiskData(format!(
            "line has {} fields, schema {} expects {}",
            tokens.len(),
            desc.name,
            desc.fields.len()
        )));
    }
    let mut values = Vec::with_capacity(desc.fields.len());
    for (token, field) in tokens.iter().zip(desc.fields.iter()) {
        values.push(parse_field(token, field)?);
    }
    Ok(Row::new(desc.clone(), values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field::FieldDescriptor;

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
    fn parses_plain_line() {
        let row = parse_line("1|Alice", &desc(), DEFAULT_DELIMITER, 4096).unwrap();
        assert_eq!(row.values[0].data, FieldData::Int(1));
        assert_eq!(row.values[1].data, FieldData::Varchar(b"Alice".to_vec()));
    }

    #[test]
    fn null_token_on_nullable_column() {
        let row = parse_line("7|(null)", &desc(), DEFAULT_DELIMITER, 4096).unwrap();
        assert!(row.values[1].is_null);
    }

    #[test]
    fn null_token_on_non_nullable_column_errors() {
        let err = parse_line("(null)|Bob", &desc(), DEFAULT_DELIMITER, 4096).unwrap_err();
        assert!(matches!(err, CoreError::WrongDiskData(_)));
    }

    #[test]
    fn quoted_field_may_contain_delimiter() {
        let row = parse_line(r#"3|"A|B""#, &desc(), DEFAULT_DELIMITER, 4096).unwrap();
        assert_eq!(row.values[1].data, FieldData::Varchar(b"A|B".to_vec()));
    }

    #[test]
    fn line_over_limit_is_terminated_buffer() {
        let err = parse_line("1|Alice", &desc(), DEFAULT_DELIMITER, 4).unwrap_err();
        assert!(matches!(err, CoreError::TerminatedBuffer));
    }

    #[test]
    fn wrong_field_count_errors() {
        let err = parse_line("1|Alice|extra", &desc(), DEFAULT_DELIMITER, 4096).unwrap_err();
        assert!(matches!(err, CoreError::WrongDiskData(_)));
    }
}
