use crate::{RelayError, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

// Read n bytes, return as Vec<u8>
pub(crate) fn parse_bytes(len: usize, rdr: &mut dyn std::io::Read) -> RelayResult<Vec<u8>> {
    let mut vec: Vec<u8> = vec![255; len];
    {
        let rf: &mut [u8] = &mut vec;
        rdr.read_exact(rf)?;
    }
    Ok(vec)
}

pub(crate) fn skip_bytes(n: usize, rdr: &mut dyn std::io::Read) -> RelayResult<()> {
    const MAXBUFLEN: usize = 16;
    if n > MAXBUFLEN {
        Err(RelayError::Impl("n > MAXBUFLEN (16)"))
    } else {
        let mut buffer = [0_u8; MAXBUFLEN];
        Ok(rdr.read_exact(&mut buffer[0..n])?)
    }
}

// Read a u32 length prefix and that many utf-8 bytes
pub(crate) fn parse_string(rdr: &mut dyn std::io::Read) -> RelayResult<String> {
    let len = rdr.read_u32::<LittleEndian>()? as usize;
    let bytes = parse_bytes(len, rdr)?;
    String::from_utf8(bytes).map_err(|_| RelayError::Impl("Invalid utf-8 on the wire"))
}

pub(crate) fn parse_uuid(rdr: &mut dyn std::io::Read) -> RelayResult<uuid::Uuid> {
    let mut buf = [0_u8; 16];
    rdr.read_exact(&mut buf)?;
    Ok(uuid::Uuid::from_bytes(buf))
}

pub(crate) async fn emit_string<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
    s: &str,
    w: &mut W,
) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    w.write_u32_le(s.len() as u32).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

pub(crate) async fn emit_bytes<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
    b: &[u8],
    w: &mut W,
) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    w.write_u32_le(b.len() as u32).await?;
    w.write_all(b).await?;
    Ok(())
}

pub(crate) fn string_size(s: &str) -> usize {
    4 + s.len()
}

pub(crate) fn bytes_size(b: &[u8]) -> usize {
    4 + b.len()
}
