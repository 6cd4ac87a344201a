mod connect_params;
mod connect_params_builder;
mod cp_url;
mod into_connect_params_builder;

pub use connect_params::ConnectParams;
pub use connect_params_builder::ConnectParamsBuilder;
pub use into_connect_params_builder::IntoConnectParamsBuilder;

use crate::{RelayError, RelayResult};

/// Validates a back-end URL after placeholder resolution.
///
/// The URL is treated as opaque apart from requiring a well-formed scheme
/// and authority; the concrete back-end driver interprets the rest.
pub fn validate_backend_url(resolved: &str) -> RelayResult<()> {
    url::Url::parse(resolved)
        .map(|_| ())
        .map_err(|e| RelayError::ConfigInvalid(format!("Invalid back-end URL: {e}")))
}

/// A trait implemented by types that can be converted into a `ConnectParams`.
pub trait IntoConnectParams {
    /// Converts the value into a `ConnectParams`.
    fn into_connect_params(self) -> RelayResult<ConnectParams>;
}

impl IntoConnectParams for ConnectParams {
    fn into_connect_params(self) -> RelayResult<ConnectParams> {
        Ok(self)
    }
}

impl IntoConnectParams for &str {
    fn into_connect_params(self) -> RelayResult<ConnectParams> {
        cp_url::parse_url(self)?.build()
    }
}

impl IntoConnectParams for String {
    fn into_connect_params(self) -> RelayResult<ConnectParams> {
        self.as_str().into_connect_params()
    }
}
