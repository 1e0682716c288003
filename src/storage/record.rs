// Row codec. A cell holds either a data record or a forward pointer.
//
// Data record:    [kind=0][null bitmap][columns in declared order]
// Forward record: [kind=1][page id u32 LE][slot u16 LE]
//
// Fixed-width columns take their declared width (Integer/Real 8 bytes
// little-endian, Boolean 1 byte); Text and Blob carry a 2-byte length
// prefix. Null columns are bit-flagged and contribute no payload.
// Records are padded to the forward-pointer length so a relocating
// update can always overwrite the original cell in place.

use crate::catalog::Column;
use crate::common::{DataType, RecordId, Row, SlotId, Value};
use crate::error::{DbError, Result};

const KIND_DATA: u8 = 0;
const KIND_FORWARD: u8 = 1;

/// Length of an encoded forward pointer; also the minimum encoded
/// record length.
pub const FORWARD_LEN: usize = 7;

/// A decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Data(Row),
    Forward(RecordId),
}

pub fn encode_forward(rid: RecordId) -> Vec<u8> {
    let mut out = Vec::with_capacity(FORWARD_LEN);
    out.push(KIND_FORWARD);
    out.extend_from_slice(&rid.page_id.to_le_bytes());
    out.extend_from_slice(&rid.slot.to_le_bytes());
    out
}

pub fn encode_row(columns: &[Column], row: &[Value]) -> Result<Vec<u8>> {
    if row.len() != columns.len() {
        return Err(DbError::Storage(format!(
            "row has {} values for {} columns",
            row.len(),
            columns.len()
        )));
    }
    let bitmap_len = columns.len().div_ceil(8);
    let mut out = vec![0u8; 1 + bitmap_len];
    out[0] = KIND_DATA;
    for (i, (column, value)) in columns.iter().zip(row.iter()).enumerate() {
        if value.is_null() {
            out[1 + i / 8] |= 1 << (i % 8);
            continue;
        }
        match (column.data_type, value) {
            (DataType::Integer, Value::Integer(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (DataType::Real, Value::Real(v)) => out.extend_from_slice(&v.to_le_bytes()),
            (DataType::Boolean, Value::Boolean(v)) => out.push(*v as u8),
            (DataType::Text, Value::Text(s)) => {
                let bytes = s.as_bytes();
                if bytes.len() > u16::MAX as usize {
                    return Err(DbError::Storage(format!(
                        "text value in '{}' exceeds {} bytes",
                        column.name,
                        u16::MAX
                    )));
                }
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            (DataType::Blob, Value::Blob(b)) => {
                if b.len() > u16::MAX as usize {
                    return Err(DbError::Storage(format!(
                        "blob value in '{}' exceeds {} bytes",
                        column.name,
                        u16::MAX
                    )));
                }
                out.extend_from_slice(&(b.len() as u16).to_le_bytes());
                out.extend_from_slice(b);
            }
            _ => {
                return Err(DbError::TypeMismatch(format!(
                    "value {:?} does not match column '{}' of type {}",
                    value, column.name, column.data_type
                )))
            }
        }
    }
    while out.len() < FORWARD_LEN {
        out.push(0);
    }
    Ok(out)
}

pub fn decode(columns: &[Column], bytes: &[u8]) -> Result<Record> {
    if bytes.is_empty() {
        return Err(DbError::Storage("empty record".into()));
    }
    match bytes[0] {
        KIND_FORWARD => {
            if bytes.len() < FORWARD_LEN {
                return Err(DbError::Storage("truncated forward pointer".into()));
            }
            let page_id = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
            let slot = SlotId::from_le_bytes(bytes[5..7].try_into().unwrap());
            Ok(Record::Forward(RecordId::new(page_id, slot)))
        }
        KIND_DATA => decode_row(columns, bytes).map(Record::Data),
        kind => Err(DbError::Storage(format!("unknown record kind {}", kind))),
    }
}

fn decode_row(columns: &[Column], bytes: &[u8]) -> Result<Row> {
    let bitmap_len = columns.len().div_ceil(8);
    if bytes.len() < 1 + bitmap_len {
        return Err(DbError::Storage("truncated record header".into()));
    }
    let bitmap = &bytes[1..1 + bitmap_len];
    let mut pos = 1 + bitmap_len;
    let mut row = Vec::with_capacity(columns.len());
    let truncated = || DbError::Storage("truncated record payload".into());
    for (i, column) in columns.iter().enumerate() {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            row.push(Value::Null);
            continue;
        }
        match column.data_type {
            DataType::Integer => {
                let end = pos + 8;
                let raw = bytes.get(pos..end).ok_or_else(truncated)?;
                row.push(Value::Integer(i64::from_le_bytes(raw.try_into().unwrap())));
                pos = end;
            }
            DataType::Real => {
                let end = pos + 8;
                let raw = bytes.get(pos..end).ok_or_else(truncated)?;
                row.push(Value::Real(f64::from_le_bytes(raw.try_into().unwrap())));
                pos = end;
            }
            DataType::Boolean => {
                let raw = *bytes.get(pos).ok_or_else(truncated)?;
                row.push(Value::Boolean(raw != 0));
                pos += 1;
            }
            DataType::Text => {
                let len_raw = bytes.get(pos..pos + 2).ok_or_else(truncated)?;
                let len = u16::from_le_bytes(len_raw.try_into().unwrap()) as usize;
                pos += 2;
                let raw = bytes.get(pos..pos + len).ok_or_else(truncated)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| DbError::Storage("invalid utf-8 in text column".into()))?;
                row.push(Value::Text(text.to_string()));
                pos += len;
            }
            DataType::Blob => {
                let len_raw = bytes.get(pos..pos + 2).ok_or_else(truncated)?;
                let len = u16::from_le_bytes(len_raw.try_into().unwrap()) as usize;
                pos += 2;
                let raw = bytes.get(pos..pos + len).ok_or_else(truncated)?;
                row.push(Value::Blob(raw.to_vec()));
                pos += len;
            }
        }
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", DataType::Integer).not_null().primary_key(),
            Column::new("name", DataType::Text),
            Column::new("score", DataType::Real),
            Column::new("active", DataType::Boolean),
            Column::new("payload", DataType::Blob),
        ]
    }

    #[test]
    fn test_round_trip() {
        let cols = columns();
        let row = vec![
            Value::Integer(42),
            Value::Text("Alice".into()),
            Value::Real(3.25),
            Value::Boolean(true),
            Value::Blob(vec![1, 2, 3]),
        ];
        let bytes = encode_row(&cols, &row).unwrap();
        assert_eq!(decode(&cols, &bytes).unwrap(), Record::Data(row));
    }

    #[test]
    fn test_round_trip_all_null_patterns() {
        let cols = columns();
        let base = vec![
            Value::Integer(1),
            Value::Text("x".into()),
            Value::Real(0.5),
            Value::Boolean(false),
            Value::Blob(vec![9]),
        ];
        for mask in 0u32..32 {
            let row: Vec<Value> = base
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    if mask & (1 << i) != 0 {
                        Value::Null
                    } else {
                        v.clone()
                    }
                })
                .collect();
            let bytes = encode_row(&cols, &row).unwrap();
            assert_eq!(decode(&cols, &bytes).unwrap(), Record::Data(row));
        }
    }

    #[test]
    fn test_forward_pointer_round_trip() {
        let rid = RecordId::new(77, 12);
        let bytes = encode_forward(rid);
        assert_eq!(bytes.len(), FORWARD_LEN);
        assert_eq!(decode(&columns(), &bytes).unwrap(), Record::Forward(rid));
    }

    #[test]
    fn test_minimum_length_padding() {
        let cols = vec![Column::new("flag", DataType::Boolean)];
        let bytes = encode_row(&cols, &[Value::Null]).unwrap();
        assert!(bytes.len() >= FORWARD_LEN);
        assert_eq!(
            decode(&cols, &bytes).unwrap(),
            Record::Data(vec![Value::Null])
        );
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let cols = vec![Column::new("id", DataType::Integer)];
        assert!(encode_row(&cols, &[Value::Text("oops".into())]).is_err());
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let cols = columns();
        assert!(encode_row(&cols, &[Value::Integer(1)]).is_err());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let cols = vec![Column::new("name", DataType::Text)];
        let bytes = encode_row(&cols, &[Value::Text("hello".into())]).unwrap();
        assert!(decode(&cols, &bytes[..bytes.len() - 2]).is_err());
    }
}
