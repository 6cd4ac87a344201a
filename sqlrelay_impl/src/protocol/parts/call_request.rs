use crate::{protocol::parts::ResourceRef, RelayError, RelayResult, RelayValue};
use byteorder::{LittleEndian, ReadBytesExt};

/// A resource method addressable through `CallResource`.
///
/// The discriminants are part of the wire protocol; the server maps each
/// (resource kind, method) pair through a static dispatch table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CallMethod {
    // connection
    SetAutoCommit = 1,
    GetAutoCommit = 2,
    Commit = 3,
    Rollback = 4,
    SetTransactionIsolation = 5,
    GetTransactionIsolation = 6,
    SetSavepoint = 7,
    ReleaseSavepoint = 8,
    RollbackToSavepoint = 9,
    SetReadOnly = 10,
    IsReadOnly = 11,
    GetMetadata = 12,
    IsValid = 13,
    PopWarnings = 14,
    // statement flavors
    GetUpdateCount = 20,
    GetMoreResults = 21,
    GetResultSet = 23,
    Cancel = 24,
    Close = 25,
    // result set
    FindColumn = 32,
    // metadata
    IsAutoIncrement = 40,
    GetColumnCount = 41,
    GetColumnLabel = 42,
    GetColumnTypeName = 43,
    IsNullable = 44,
    // lob
    Length = 50,
    Free = 52,
    // savepoint
    GetSavepointId = 60,
    GetSavepointName = 61,
}

impl CallMethod {
    pub(crate) fn try_from_u16(i: u16) -> RelayResult<Self> {
        Ok(match i {
            1 => Self::SetAutoCommit,
            2 => Self::GetAutoCommit,
            3 => Self::Commit,
            4 => Self::Rollback,
            5 => Self::SetTransactionIsolation,
            6 => Self::GetTransactionIsolation,
            7 => Self::SetSavepoint,
            8 => Self::ReleaseSavepoint,
            9 => Self::RollbackToSavepoint,
            10 => Self::SetReadOnly,
            11 => Self::IsReadOnly,
            12 => Self::GetMetadata,
            13 => Self::IsValid,
            14 => Self::PopWarnings,
            20 => Self::GetUpdateCount,
            21 => Self::GetMoreResults,
            23 => Self::GetResultSet,
            24 => Self::Cancel,
            25 => Self::Close,
            32 => Self::FindColumn,
            40 => Self::IsAutoIncrement,
            41 => Self::GetColumnCount,
            42 => Self::GetColumnLabel,
            43 => Self::GetColumnTypeName,
            44 => Self::IsNullable,
            50 => Self::Length,
            52 => Self::Free,
            60 => Self::GetSavepointId,
            61 => Self::GetSavepointName,
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid call method {i} on the wire"
                )))
            }
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// One step of a call: the method and its arguments.
#[derive(Clone, Debug)]
pub struct CallStep {
    pub method: CallMethod,
    pub args: Vec<RelayValue>,
}

impl CallStep {
    pub fn new(method: CallMethod, args: Vec<RelayValue>) -> Self {
        Self { method, args }
    }

    fn size(&self) -> usize {
        2 + 2 + self.args.iter().map(RelayValue::size).sum::<usize>()
    }

    #[allow(clippy::cast_possible_truncation)]
    async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_u16_le(self.method.as_u16()).await?;
        w.write_u16_le(self.args.len() as u16).await?;
        for arg in &self.args {
            arg.emit(w).await?;
        }
        Ok(())
    }

    fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let method = CallMethod::try_from_u16(rdr.read_u16::<LittleEndian>()?)?;
        let no_of_args = rdr.read_u16::<LittleEndian>()? as usize;
        let mut args = Vec::with_capacity(no_of_args);
        for _ in 0..no_of_args {
            args.push(RelayValue::parse(rdr)?);
        }
        Ok(Self { method, args })
    }
}

/// Invokes a method on a session resource, optionally chaining a second call
/// on the first call's resource result (`get_metadata().is_auto_increment(i)`
/// in one round trip).
#[derive(Debug)]
pub struct CallRequest {
    resource: ResourceRef,
    call: CallStep,
    chained: Option<CallStep>,
}

impl CallRequest {
    pub fn new(resource: ResourceRef, call: CallStep) -> Self {
        Self {
            resource,
            call,
            chained: None,
        }
    }

    pub fn with_chained(resource: ResourceRef, call: CallStep, chained: CallStep) -> Self {
        Self {
            resource,
            call,
            chained: Some(chained),
        }
    }

    pub fn resource(&self) -> ResourceRef {
        self.resource
    }

    pub fn call(&self) -> &CallStep {
        &self.call
    }

    pub fn chained(&self) -> Option<&CallStep> {
        self.chained.as_ref()
    }

    pub fn size(&self) -> usize {
        ResourceRef::size()
            + self.call.size()
            + 1
            + self.chained.as_ref().map_or(0, CallStep::size)
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        trace!(
            "call_request::emit() {:?} on {} {}",
            self.call.method,
            self.resource.kind,
            self.resource.id
        );
        self.resource.emit(w).await?;
        self.call.emit(w).await?;
        match &self.chained {
            Some(chained) => {
                w.write_u8(1).await?;
                chained.emit(w).await?;
            }
            None => w.write_u8(0).await?,
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let resource = ResourceRef::parse(rdr)?;
        let call = CallStep::parse(rdr)?;
        let chained = if rdr.read_u8()? != 0 {
            Some(CallStep::parse(rdr)?)
        } else {
            None
        };
        Ok(Self {
            resource,
            call,
            chained,
        })
    }
}

