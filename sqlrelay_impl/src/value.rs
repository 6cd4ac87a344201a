use crate::{protocol::util_sync, RelayError, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// Wire-level type of a [`RelayValue`](crate::RelayValue).
///
/// The ids are stable; they appear in result-set metadata and in every
/// serialized value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TypeId {
    Boolean = 1,
    Int = 2,
    BigInt = 3,
    Double = 4,
    Decimal = 5,
    Varchar = 6,
    Binary = 7,
    Date = 8,
    Time = 9,
    Timestamp = 10,
    Blob = 11,
    Clob = 12,
}

impl TypeId {
    pub fn try_from_u8(i: u8) -> RelayResult<Self> {
        Ok(match i {
            1 => Self::Boolean,
            2 => Self::Int,
            3 => Self::BigInt,
            4 => Self::Double,
            5 => Self::Decimal,
            6 => Self::Varchar,
            7 => Self::Binary,
            8 => Self::Date,
            9 => Self::Time,
            10 => Self::Timestamp,
            11 => Self::Blob,
            12 => Self::Clob,
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid type id {i} on the wire"
                )))
            }
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A typed value as it travels between driver, proxy, and back-end.
///
/// NULL is an explicit variant carrying the column type, so a receiver can
/// always answer "was null" without a side channel.
/// Temporal values travel as their ISO-8601 rendering, decimals as their
/// plain-text rendering; LOB columns travel as a handle that is read through
/// the LOB streaming operations.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayValue {
    Null(TypeId),
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Decimal(String),
    Varchar(String),
    Binary(Vec<u8>),
    Date(String),
    Time(String),
    Timestamp(String),
    /// Server-issued handle of a binary large object.
    Blob(uuid::Uuid),
    /// Server-issued handle of a character large object.
    Clob(uuid::Uuid),
}

impl RelayValue {
    pub fn type_id(&self) -> TypeId {
        match self {
            Self::Null(type_id) => *type_id,
            Self::Boolean(_) => TypeId::Boolean,
            Self::Int(_) => TypeId::Int,
            Self::BigInt(_) => TypeId::BigInt,
            Self::Double(_) => TypeId::Double,
            Self::Decimal(_) => TypeId::Decimal,
            Self::Varchar(_) => TypeId::Varchar,
            Self::Binary(_) => TypeId::Binary,
            Self::Date(_) => TypeId::Date,
            Self::Time(_) => TypeId::Time,
            Self::Timestamp(_) => TypeId::Timestamp,
            Self::Blob(_) => TypeId::Blob,
            Self::Clob(_) => TypeId::Clob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// Number of bytes this value occupies on the wire.
    pub fn size(&self) -> usize {
        // type id + null marker
        2 + match self {
            Self::Null(_) => 0,
            Self::Boolean(_) => 1,
            Self::Int(_) => 4,
            Self::BigInt(_) | Self::Double(_) => 8,
            Self::Decimal(s)
            | Self::Varchar(s)
            | Self::Date(s)
            | Self::Time(s)
            | Self::Timestamp(s) => 4 + s.len(),
            Self::Binary(b) => 4 + b.len(),
            Self::Blob(_) | Self::Clob(_) => 16,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_u8(self.type_id().as_u8()).await?;
        w.write_u8(u8::from(self.is_null())).await?;
        match self {
            Self::Null(_) => {}
            Self::Boolean(b) => w.write_u8(u8::from(*b)).await?,
            Self::Int(i) => w.write_i32_le(*i).await?,
            Self::BigInt(i) => w.write_i64_le(*i).await?,
            Self::Double(d) => w.write_f64_le(*d).await?,
            Self::Decimal(s)
            | Self::Varchar(s)
            | Self::Date(s)
            | Self::Time(s)
            | Self::Timestamp(s) => {
                w.write_u32_le(s.len() as u32).await?;
                w.write_all(s.as_bytes()).await?;
            }
            Self::Binary(b) => {
                w.write_u32_le(b.len() as u32).await?;
                w.write_all(b).await?;
            }
            Self::Blob(id) | Self::Clob(id) => w.write_all(id.as_bytes()).await?,
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let type_id = TypeId::try_from_u8(rdr.read_u8()?)?;
        let is_null = rdr.read_u8()? != 0;
        if is_null {
            return Ok(Self::Null(type_id));
        }
        Ok(match type_id {
            TypeId::Boolean => Self::Boolean(rdr.read_u8()? != 0),
            TypeId::Int => Self::Int(rdr.read_i32::<LittleEndian>()?),
            TypeId::BigInt => Self::BigInt(rdr.read_i64::<LittleEndian>()?),
            TypeId::Double => Self::Double(rdr.read_f64::<LittleEndian>()?),
            TypeId::Decimal => Self::Decimal(util_sync::parse_string(rdr)?),
            TypeId::Varchar => Self::Varchar(util_sync::parse_string(rdr)?),
            TypeId::Date => Self::Date(util_sync::parse_string(rdr)?),
            TypeId::Time => Self::Time(util_sync::parse_string(rdr)?),
            TypeId::Timestamp => Self::Timestamp(util_sync::parse_string(rdr)?),
            TypeId::Binary => {
                #[allow(clippy::cast_possible_truncation)]
                let len = rdr.read_u32::<LittleEndian>()? as usize;
                Self::Binary(util_sync::parse_bytes(len, rdr)?)
            }
            TypeId::Blob => Self::Blob(util_sync::parse_uuid(rdr)?),
            TypeId::Clob => Self::Clob(util_sync::parse_uuid(rdr)?),
        })
    }

    /// Accessor for integral values, tolerant of widening.
    pub fn try_into_i64(&self) -> RelayResult<i64> {
        match self {
            Self::Int(i) => Ok(i64::from(*i)),
            Self::BigInt(i) => Ok(*i),
            _ => Err(RelayError::UsageDetailed(format!(
                "Not an integral value: {self:?}"
            ))),
        }
    }
}

impl std::fmt::Display for RelayValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Null(_) => write!(f, "<NULL>"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::BigInt(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::Decimal(s)
            | Self::Varchar(s)
            | Self::Date(s)
            | Self::Time(s)
            | Self::Timestamp(s) => write!(f, "{s}"),
            Self::Binary(b) => write!(f, "<BINARY, {} bytes>", b.len()),
            Self::Blob(id) => write!(f, "<BLOB {id}>"),
            Self::Clob(id) => write!(f, "<CLOB {id}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RelayValue, TypeId};

    async fn round_trip(value: RelayValue) {
        let mut buf = Vec::<u8>::new();
        value.emit(&mut buf).await.unwrap();
        assert_eq!(buf.len(), value.size());
        let mut rdr = std::io::Cursor::new(buf);
        assert_eq!(value, RelayValue::parse(&mut rdr).unwrap());
    }

    #[tokio::test]
    async fn values_survive_the_wire() {
        round_trip(RelayValue::Null(TypeId::Varchar)).await;
        round_trip(RelayValue::Boolean(true)).await;
        round_trip(RelayValue::Int(-42)).await;
        round_trip(RelayValue::BigInt(i64::MIN)).await;
        round_trip(RelayValue::Double(2.5)).await;
        round_trip(RelayValue::Decimal("123.456".to_string())).await;
        round_trip(RelayValue::Varchar("älteste Häuser".to_string())).await;
        round_trip(RelayValue::Binary(vec![0, 1, 2, 255])).await;
        round_trip(RelayValue::Timestamp("2024-02-29T12:00:00".to_string())).await;
        round_trip(RelayValue::Blob(uuid::Uuid::new_v4())).await;
    }
}
