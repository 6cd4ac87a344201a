use crate::{protocol::util_sync, ErrorKind, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::error::Error;

/// Severity of a server message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Severity {
    /// An additional warning is sent from the server to the client,
    /// along with the regular response.
    Warning,
    /// The request sent to the server was not correct or could not be answered
    /// correctly.
    Error,
    /// A fatal, session-terminating error occured.
    Fatal,

    /// The request sent to the server could not be answered, for an unknown reason.
    __UNKNOWN__(i8),
}

impl Severity {
    pub(crate) fn from_i8(i: i8) -> Self {
        match i {
            0 => Self::Warning,
            1 => Self::Error,
            2 => Self::Fatal,
            i => Self::__UNKNOWN__(i),
        }
    }

    /// Returns the number encoding of the severity.
    #[must_use]
    pub fn to_i8(&self) -> i8 {
        match *self {
            Self::Warning => 0,
            Self::Error => 1,
            Self::Fatal => 2,
            Self::__UNKNOWN__(i) => i,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::Warning => write!(f, "Warning")?,
            Self::Error => write!(f, "Error")?,
            Self::Fatal => write!(f, "Fatal error")?,
            Self::__UNKNOWN__(i) => write!(f, "Message of unknown severity ({i})")?,
        }
        Ok(())
    }
}

/// An error as it travels over the wire.
///
/// Back-end errors keep their five-character SQL state and vendor code;
/// proxy-originated errors carry the default state `HY000` and their
/// [`ErrorKind`](crate::ErrorKind).
#[derive(Clone, PartialEq, Eq)]
pub struct ServerError {
    kind: ErrorKind,
    code: i32,
    severity: Severity,
    sqlstate: Vec<u8>,
    text: String,
    chain: Option<String>,
}

impl ServerError {
    /// SQL state reported when no more specific state is known.
    pub const SQLSTATE_GENERAL: &'static [u8; 5] = b"HY000";

    pub fn new(
        kind: ErrorKind,
        code: i32,
        severity: Severity,
        sqlstate: Vec<u8>,
        text: String,
        chain: Option<String>,
    ) -> Self {
        Self {
            kind,
            code,
            severity,
            sqlstate,
            text,
            chain,
        }
    }

    /// A back-end SQL error with preserved state and vendor code.
    pub fn backend(code: i32, sqlstate: &[u8], text: String) -> Self {
        Self::new(
            ErrorKind::BackendSql,
            code,
            Severity::Error,
            sqlstate.to_vec(),
            text,
            None,
        )
    }

    /// Returns the stable error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the vendor code.
    #[must_use]
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Returns the severity of the error.
    #[must_use]
    pub fn severity(&self) -> &Severity {
        &self.severity
    }

    /// Returns the SQL state of the error.
    #[must_use]
    pub fn sqlstate(&self) -> &[u8] {
        &self.sqlstate
    }

    /// Returns the description of the error.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the summarized cause chain, if one was attached.
    pub fn chain(&self) -> Option<&str> {
        self.chain.as_deref()
    }

    /// True if the SQL state class is `08` (connection exception); the
    /// session's physical connection must not be reused.
    pub fn is_connection_failure(&self) -> bool {
        self.sqlstate.starts_with(b"08")
    }

    pub fn size(&self) -> usize {
        1 + 4
            + 1
            + 5
            + util_sync::string_size(&self.text)
            + 1
            + self.chain.as_deref().map_or(0, util_sync::string_size)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_u8(self.kind.to_u8()).await?;
        w.write_i32_le(self.code).await?;
        w.write_i8(self.severity.to_i8()).await?;
        let mut sqlstate = [b' '; 5];
        for (i, b) in self.sqlstate.iter().take(5).enumerate() {
            sqlstate[i] = *b;
        }
        w.write_all(&sqlstate).await?;
        util_sync::emit_string(&self.text, w).await?;
        match self.chain.as_deref() {
            Some(chain) => {
                w.write_u8(1).await?;
                util_sync::emit_string(chain, w).await?;
            }
            None => w.write_u8(0).await?,
        }
        Ok(())
    }

    pub fn parse(no_of_args: usize, rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Vec<Self>> {
        let mut server_errors = Vec::<Self>::new();
        for _ in 0..no_of_args {
            let kind = ErrorKind::from_u8(rdr.read_u8()?);
            let code = rdr.read_i32::<LittleEndian>()?;
            let severity = Severity::from_i8(rdr.read_i8()?);
            let sqlstate = util_sync::parse_bytes(5_usize, rdr)?;
            let text = util_sync::parse_string(rdr)?;
            let chain = if rdr.read_u8()? != 0 {
                Some(util_sync::parse_string(rdr)?)
            } else {
                None
            };

            let server_error = Self::new(kind, code, severity, sqlstate, text, chain);
            debug!("ServerError::parse(): found server error {server_error}");
            server_errors.push(server_error);
        }
        Ok(server_errors)
    }
}

impl Error for ServerError {}

impl std::fmt::Display for ServerError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            r#"{} ({})[code: {}, sql state: {}]: "{}""#,
            self.severity,
            self.kind,
            self.code,
            String::from_utf8_lossy(&self.sqlstate),
            self.text
        )
    }
}

impl std::fmt::Debug for ServerError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{self}")
    }
}
