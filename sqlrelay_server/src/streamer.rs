//! Block-oriented delivery of result-set rows and LOB bytes.
//!
//! Rows leave the server in blocks of the session's fetch size; LOB columns
//! are rewritten from back-end locators into session handles before they
//! reach the wire. LOB reads compute each block as `min(cap, remaining)`
//! and trim trailing zero padding only when the total length is unknown.

use crate::session::{LobEntry, Session};
use sqlrelay_impl::{
    LobKind, RelayResult, RelayValue, ResultSetMetadata, TypeId,
};
use uuid::Uuid;

/// Rewrites LOB locators in fetched rows into session LOB handles.
///
/// Back-ends report LOB columns as `BigInt` locators (see the backend trait
/// contract); clients must only ever see handles they can pass to the LOB
/// streaming operations.
pub fn wrap_lob_columns(
    session: &mut Session,
    metadata: &ResultSetMetadata,
    statement: Option<Uuid>,
    rows: &mut [Vec<RelayValue>],
) -> RelayResult<Vec<Uuid>> {
    let lob_columns: Vec<(usize, LobKind)> = metadata
        .fields()
        .iter()
        .enumerate()
        .filter_map(|(i, f)| match f.type_id() {
            TypeId::Blob => Some((i, LobKind::Blob)),
            TypeId::Clob => Some((i, LobKind::Clob)),
            _ => None,
        })
        .collect();
    let mut handles = Vec::new();
    if lob_columns.is_empty() {
        return Ok(handles);
    }
    for row in rows.iter_mut() {
        for &(column, kind) in &lob_columns {
            let Some(value) = row.get_mut(column) else {
                continue;
            };
            let locator = match value {
                RelayValue::BigInt(locator) => u64::try_from(*locator).unwrap_or_default(),
                _ => continue, // NULL lob
            };
            let handle = session.lobs.put(LobEntry {
                kind,
                locator,
                statement,
                written: 0,
            });
            handles.push(handle);
            *value = match kind {
                LobKind::Clob => RelayValue::Clob(handle),
                _ => RelayValue::Blob(handle),
            };
        }
    }
    Ok(handles)
}

/// True if any column of the result set is a LOB; only such result sets are
/// candidates for row-by-row streaming.
pub fn has_lob_columns(metadata: &ResultSetMetadata) -> bool {
    metadata
        .fields()
        .iter()
        .any(|f| matches!(f.type_id(), TypeId::Blob | TypeId::Clob))
}

/// The size of the next LOB read block: bounded by the cap and, where the
/// total length is known, by the remaining bytes.
pub fn next_lob_block_size(block_cap: u32, requested_remaining: u64, o_total_remaining: Option<u64>) -> u32 {
    let mut size = u64::from(block_cap).min(requested_remaining);
    if let Some(total_remaining) = o_total_remaining {
        size = size.min(total_remaining);
    }
    u32::try_from(size).unwrap_or(block_cap)
}

/// Removes trailing zero padding from the final block of a LOB whose total
/// length the back-end does not report. Known-length LOBs are sized exactly
/// and must not be trimmed.
pub fn trim_trailing_zeros(mut data: Vec<u8>) -> Vec<u8> {
    while data.last() == Some(&0) {
        data.pop();
    }
    data
}

#[cfg(test)]
mod tests {
    use super::{next_lob_block_size, trim_trailing_zeros, wrap_lob_columns};
    use crate::session::Session;
    use sqlrelay_impl::{FieldMetadata, RelayValue, ResultSetMetadata, TypeId};
    use uuid::Uuid;

    #[test]
    fn block_size_arithmetic() {
        assert_eq!(1024, next_lob_block_size(1024, 10_000, None));
        assert_eq!(10, next_lob_block_size(1024, 10, None));
        assert_eq!(500, next_lob_block_size(1024, 10_000, Some(500)));
        assert_eq!(0, next_lob_block_size(1024, 10_000, Some(0)));
    }

    #[test]
    fn zero_trim() {
        assert_eq!(vec![1, 2, 3], trim_trailing_zeros(vec![1, 2, 3, 0, 0]));
        assert_eq!(vec![1, 0, 3], trim_trailing_zeros(vec![1, 0, 3]));
        assert!(trim_trailing_zeros(vec![0, 0]).is_empty());
    }

    #[test]
    fn locators_become_handles() {
        let mut session = Session::new(Uuid::new_v4(), "h".to_string(), false);
        let metadata = ResultSetMetadata::new(vec![
            FieldMetadata::new("ID".to_string(), TypeId::Int, false),
            FieldMetadata::new("DATA".to_string(), TypeId::Blob, true),
        ]);
        let mut rows = vec![
            vec![RelayValue::Int(1), RelayValue::BigInt(77)],
            vec![RelayValue::Int(2), RelayValue::Null(TypeId::Blob)],
        ];
        wrap_lob_columns(&mut session, &metadata, None, &mut rows).unwrap();
        match rows[0][1] {
            RelayValue::Blob(handle) => {
                assert_eq!(77, session.lobs.get(handle).unwrap().locator);
            }
            ref other => panic!("Expected a blob handle, got {other:?}"),
        }
        assert_eq!(RelayValue::Null(TypeId::Blob), rows[1][1]);
    }
}
