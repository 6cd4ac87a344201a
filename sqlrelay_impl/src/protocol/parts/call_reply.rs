use crate::{protocol::parts::ResourceRef, RelayError, RelayResult, RelayValue};
use byteorder::ReadBytesExt;

/// The typed result of a `CallResource` invocation.
#[derive(Clone, Debug)]
pub enum CallValue {
    /// The method has no return value.
    Void,
    /// A primitive result.
    Scalar(RelayValue),
    /// The method returned a resource, wrapped into a fresh handle.
    Handle(ResourceRef),
}

/// Reply payload of `CallResource`.
#[derive(Debug)]
pub struct CallReply {
    value: CallValue,
}

impl CallReply {
    pub fn new(value: CallValue) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &CallValue {
        &self.value
    }

    pub fn into_value(self) -> CallValue {
        self.value
    }

    /// The scalar result, if there is one.
    pub fn scalar(&self) -> RelayResult<&RelayValue> {
        match &self.value {
            CallValue::Scalar(v) => Ok(v),
            other => Err(RelayError::UsageDetailed(format!(
                "Call did not return a scalar but {other:?}"
            ))),
        }
    }

    /// The handle result, if there is one.
    pub fn handle(&self) -> RelayResult<ResourceRef> {
        match &self.value {
            CallValue::Handle(r) => Ok(*r),
            other => Err(RelayError::UsageDetailed(format!(
                "Call did not return a resource but {other:?}"
            ))),
        }
    }

    pub fn size(&self) -> usize {
        1 + match &self.value {
            CallValue::Void => 0,
            CallValue::Scalar(v) => v.size(),
            CallValue::Handle(_) => ResourceRef::size(),
        }
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        match &self.value {
            CallValue::Void => w.write_u8(0).await?,
            CallValue::Scalar(v) => {
                w.write_u8(1).await?;
                v.emit(w).await?;
            }
            CallValue::Handle(r) => {
                w.write_u8(2).await?;
                r.emit(w).await?;
            }
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let value = match rdr.read_u8()? {
            0 => CallValue::Void,
            1 => CallValue::Scalar(RelayValue::parse(rdr)?),
            2 => CallValue::Handle(ResourceRef::parse(rdr)?),
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid call value marker {i} on the wire"
                )))
            }
        };
        Ok(Self { value })
    }
}
