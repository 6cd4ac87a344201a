use crate::{protocol::util_sync, RelayResult};
use byteorder::ReadBytesExt;

/// Descriptive information about the connecting application.
///
/// Forwarded to the back-end where the driver supports it, and echoed in the
/// server's session log lines.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientInfo {
    application: Option<String>,
    application_version: Option<String>,
    application_user: Option<String>,
}

impl ClientInfo {
    pub fn set_application<S: AsRef<str>>(&mut self, application: S) {
        self.application = Some(application.as_ref().to_string());
    }

    pub fn set_application_version(&mut self, version: &str) {
        self.application_version = Some(version.to_string());
    }

    pub fn set_application_user(&mut self, user: &str) {
        self.application_user = Some(user.to_string());
    }

    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    pub fn application_version(&self) -> Option<&str> {
        self.application_version.as_deref()
    }

    pub fn application_user(&self) -> Option<&str> {
        self.application_user.as_deref()
    }

    pub(crate) fn count(&self) -> usize {
        3
    }

    // fields are emitted in fixed order, one presence byte each
    pub fn size(&self) -> usize {
        3 + [
            &self.application,
            &self.application_version,
            &self.application_user,
        ]
        .iter()
        .map(|o| o.as_deref().map_or(0, util_sync::string_size))
        .sum::<usize>()
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        for field in [
            &self.application,
            &self.application_version,
            &self.application_user,
        ] {
            match field {
                Some(s) => {
                    w.write_u8(1).await?;
                    util_sync::emit_string(s, w).await?;
                }
                None => w.write_u8(0).await?,
            }
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let mut fields = [None, None, None];
        for field in &mut fields {
            if rdr.read_u8()? != 0 {
                *field = Some(util_sync::parse_string(rdr)?);
            }
        }
        let [application, application_version, application_user] = fields;
        Ok(Self {
            application,
            application_version,
            application_user,
        })
    }
}

impl std::fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}/{} (user {})",
            self.application.as_deref().unwrap_or("?"),
            self.application_version.as_deref().unwrap_or("?"),
            self.application_user.as_deref().unwrap_or("?")
        )
    }
}
