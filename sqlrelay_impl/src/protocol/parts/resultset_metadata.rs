use crate::{protocol::util_sync, RelayError, RelayResult, TypeId};
use byteorder::ReadBytesExt;
use std::collections::HashMap;

/// Describes one column of a result set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldMetadata {
    label: String,
    type_id: TypeId,
    nullable: bool,
}

impl FieldMetadata {
    pub fn new(label: String, type_id: TypeId, nullable: bool) -> Self {
        Self {
            label,
            type_id,
            nullable,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

/// The ordered column descriptions of a result set, with label lookup.
#[derive(Clone, Debug, Default)]
pub struct ResultSetMetadata {
    fields: Vec<FieldMetadata>,
    names: HashMap<String, usize>,
}

impl ResultSetMetadata {
    pub fn new(fields: Vec<FieldMetadata>) -> Self {
        let names = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.label.clone(), i))
            .collect();
        Self { fields, names }
    }

    /// Number of columns.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    /// Column index of the given label.
    pub fn index_of(&self, label: &str) -> RelayResult<usize> {
        self.names
            .get(label)
            .copied()
            .ok_or_else(|| RelayError::UsageDetailed(format!("Unknown column label \"{label}\"")))
    }

    pub fn size(&self) -> usize {
        self.fields
            .iter()
            .map(|f| util_sync::string_size(&f.label) + 2)
            .sum()
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        for field in &self.fields {
            util_sync::emit_string(&field.label, w).await?;
            w.write_u8(field.type_id.as_u8()).await?;
            w.write_u8(u8::from(field.nullable)).await?;
        }
        Ok(())
    }

    pub fn parse(no_of_args: usize, rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let mut fields = Vec::with_capacity(no_of_args);
        for _ in 0..no_of_args {
            let label = util_sync::parse_string(rdr)?;
            let type_id = TypeId::try_from_u8(rdr.read_u8()?)?;
            let nullable = rdr.read_u8()? != 0;
            fields.push(FieldMetadata::new(label, type_id, nullable));
        }
        Ok(Self::new(fields))
    }
}

