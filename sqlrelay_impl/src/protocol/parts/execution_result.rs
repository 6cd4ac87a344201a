use crate::{protocol::parts::ServerError, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// The outcome of a single statement within an execute request.
#[derive(Clone, Debug)]
pub enum ExecutionResult {
    /// Number of affected rows.
    RowsAffected(i64),
    /// The statement succeeded without a countable effect.
    SuccessNoInfo,
    /// The statement failed; the error is also reported in the error part.
    Failure(Option<ServerError>),
}

impl ExecutionResult {
    pub fn size(&self) -> usize {
        1 + match self {
            Self::RowsAffected(_) => 8,
            Self::SuccessNoInfo => 0,
            Self::Failure(o_e) => 1 + o_e.as_ref().map_or(0, ServerError::size),
        }
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        match self {
            Self::RowsAffected(count) => {
                w.write_u8(0).await?;
                w.write_i64_le(*count).await?;
            }
            Self::SuccessNoInfo => w.write_u8(1).await?,
            Self::Failure(o_e) => {
                w.write_u8(2).await?;
                match o_e {
                    Some(e) => {
                        w.write_u8(1).await?;
                        e.emit(w).await?;
                    }
                    None => w.write_u8(0).await?,
                }
            }
        }
        Ok(())
    }

    pub fn parse(no_of_args: usize, rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Vec<Self>> {
        let mut results = Vec::with_capacity(no_of_args);
        for _ in 0..no_of_args {
            results.push(match rdr.read_u8()? {
                0 => Self::RowsAffected(rdr.read_i64::<LittleEndian>()?),
                1 => Self::SuccessNoInfo,
                _ => {
                    let o_e = if rdr.read_u8()? != 0 {
                        ServerError::parse(1, rdr)?.pop()
                    } else {
                        None
                    };
                    Self::Failure(o_e)
                }
            });
        }
        Ok(results)
    }

    /// True if this is a [`Failure`](ExecutionResult::Failure).
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::RowsAffected(count) => writeln!(fmt, "Number of affected rows: {count}"),
            Self::SuccessNoInfo => writeln!(
                fmt,
                "Command successfully executed but number of affected rows cannot be determined"
            ),
            Self::Failure(Some(e)) => writeln!(fmt, "Failed with error: {e}"),
            Self::Failure(None) => writeln!(fmt, "Failed with unspecified error"),
        }
    }
}
