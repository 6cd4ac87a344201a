use crate::{protocol::util_sync, RelayError, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// A two-phase-commit transaction identifier.
///
/// Global transaction id and branch qualifier are opaque byte strings of at
/// most 64 bytes each, as in the XA specification.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Xid {
    format_id: i64,
    global_tid: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    pub const MAX_COMPONENT_LENGTH: usize = 64;

    pub fn try_new(
        format_id: i64,
        global_tid: Vec<u8>,
        branch_qualifier: Vec<u8>,
    ) -> RelayResult<Self> {
        if global_tid.len() > Self::MAX_COMPONENT_LENGTH
            || branch_qualifier.len() > Self::MAX_COMPONENT_LENGTH
        {
            return Err(RelayError::Usage(
                "XID component longer than 64 bytes",
            ));
        }
        Ok(Self {
            format_id,
            global_tid,
            branch_qualifier,
        })
    }

    pub fn format_id(&self) -> i64 {
        self.format_id
    }

    pub fn global_tid(&self) -> &[u8] {
        &self.global_tid
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }

    fn size(&self) -> usize {
        8 + util_sync::bytes_size(&self.global_tid) + util_sync::bytes_size(&self.branch_qualifier)
    }

    async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_i64_le(self.format_id).await?;
        util_sync::emit_bytes(&self.global_tid, w).await?;
        util_sync::emit_bytes(&self.branch_qualifier, w).await?;
        Ok(())
    }

    fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let format_id = rdr.read_i64::<LittleEndian>()?;
        let gt_len = rdr.read_u32::<LittleEndian>()? as usize;
        let global_tid = util_sync::parse_bytes(gt_len, rdr)?;
        let bq_len = rdr.read_u32::<LittleEndian>()? as usize;
        let branch_qualifier = util_sync::parse_bytes(bq_len, rdr)?;
        Self::try_new(format_id, global_tid, branch_qualifier)
    }
}

impl std::fmt::Display for Xid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "xid({}, {}, {})",
            self.format_id,
            hex::encode(&self.global_tid),
            hex::encode(&self.branch_qualifier)
        )
    }
}

/// XA flag bits, a subset of the values defined by the XA specification.
pub mod xa_flags {
    pub const NONE: u32 = 0;
    pub const JOIN: u32 = 0x0020_0000;
    pub const RESUME: u32 = 0x0800_0000;
    pub const SUCCESS: u32 = 0x0400_0000;
    pub const FAIL: u32 = 0x2000_0000;
    pub const SUSPEND: u32 = 0x0200_0000;
    pub const ONE_PHASE: u32 = 0x4000_0000;
    pub const START_RECOVERY_SCAN: u32 = 0x0100_0000;
    pub const END_RECOVERY_SCAN: u32 = 0x0080_0000;
}

/// Payload of every XA verb: flags, an optional xid, an optional return code,
/// and (for recover) a list of xids.
#[derive(Clone, Debug, Default)]
pub struct XatOptions {
    flags: u32,
    return_code: Option<i32>,
    xids: Vec<Xid>,
}

impl XatOptions {
    pub fn set_xid(&mut self, xid: Xid) {
        self.xids = vec![xid];
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn set_return_code(&mut self, return_code: i32) {
        self.return_code = Some(return_code);
    }

    pub fn set_xids(&mut self, xids: Vec<Xid>) {
        self.xids = xids;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// True if the flags contain no bits outside `allowed`.
    pub fn flags_contain_only(&self, allowed: u32) -> bool {
        self.flags & !allowed == 0
    }

    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xids.first()
    }

    pub fn into_xids(self) -> Vec<Xid> {
        self.xids
    }

    pub fn size(&self) -> usize {
        4 + 1
            + self.return_code.map_or(0, |_| 4)
            + 4
            + self.xids.iter().map(Xid::size).sum::<usize>()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_u32_le(self.flags).await?;
        match self.return_code {
            Some(rc) => {
                w.write_u8(1).await?;
                w.write_i32_le(rc).await?;
            }
            None => w.write_u8(0).await?,
        }
        w.write_u32_le(self.xids.len() as u32).await?;
        for xid in &self.xids {
            xid.emit(w).await?;
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let flags = rdr.read_u32::<LittleEndian>()?;
        let return_code = if rdr.read_u8()? != 0 {
            Some(rdr.read_i32::<LittleEndian>()?)
        } else {
            None
        };
        let no_of_xids = rdr.read_u32::<LittleEndian>()? as usize;
        let mut xids = Vec::with_capacity(no_of_xids);
        for _ in 0..no_of_xids {
            xids.push(Xid::parse(rdr)?);
        }
        Ok(Self {
            flags,
            return_code,
            xids,
        })
    }
}
