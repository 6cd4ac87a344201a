use crate::{protocol::util_sync, RelayResult, RelayValue};
use byteorder::{LittleEndian, ReadBytesExt};

/// One block of result-set rows.
///
/// Blocks for a given result set arrive in back-end order; the final block is
/// flagged, after which the server-side cursor is gone. In row-by-row mode a
/// block carries at most one row.
#[derive(Debug)]
pub struct ResultSetBlock {
    result_set_id: uuid::Uuid,
    row_by_row: bool,
    is_last: bool,
    rows: Vec<Vec<RelayValue>>,
}

impl ResultSetBlock {
    pub fn new(
        result_set_id: uuid::Uuid,
        row_by_row: bool,
        is_last: bool,
        rows: Vec<Vec<RelayValue>>,
    ) -> Self {
        Self {
            result_set_id,
            row_by_row,
            is_last,
            rows,
        }
    }

    pub fn result_set_id(&self) -> uuid::Uuid {
        self.result_set_id
    }

    pub fn row_by_row(&self) -> bool {
        self.row_by_row
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn no_of_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn into_rows(self) -> Vec<Vec<RelayValue>> {
        self.rows
    }

    pub fn size(&self) -> usize {
        16 + 1
            + 1
            + 4
            + self
                .rows
                .iter()
                .map(|row| 4 + row.iter().map(RelayValue::size).sum::<usize>())
                .sum::<usize>()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        trace!(
            "result_set_block::emit() {} rows, is_last = {}",
            self.rows.len(),
            self.is_last
        );
        w.write_all(self.result_set_id.as_bytes()).await?;
        w.write_u8(u8::from(self.row_by_row)).await?;
        w.write_u8(u8::from(self.is_last)).await?;
        w.write_u32_le(self.rows.len() as u32).await?;
        for row in &self.rows {
            w.write_u32_le(row.len() as u32).await?;
            for value in row {
                value.emit(w).await?;
            }
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let result_set_id = util_sync::parse_uuid(rdr)?;
        let row_by_row = rdr.read_u8()? != 0;
        let is_last = rdr.read_u8()? != 0;
        let no_of_rows = rdr.read_u32::<LittleEndian>()? as usize;
        let mut rows = Vec::with_capacity(no_of_rows);
        for i in 0..no_of_rows {
            let no_of_values = rdr.read_u32::<LittleEndian>()? as usize;
            let mut row = Vec::with_capacity(no_of_values);
            for _ in 0..no_of_values {
                row.push(RelayValue::parse(rdr)?);
            }
            trace!("parse(): found row #{i}");
            rows.push(row);
        }
        Ok(Self {
            result_set_id,
            row_by_row,
            is_last,
            rows,
        })
    }
}

