use super::cp_url;
use crate::{ConnectParamsBuilder, RelayResult};

/// A trait implemented by types that can be converted into a
/// `ConnectParamsBuilder`.
pub trait IntoConnectParamsBuilder {
    /// Converts the value into a `ConnectParamsBuilder`.
    fn into_connect_params_builder(self) -> RelayResult<ConnectParamsBuilder>;
}

impl IntoConnectParamsBuilder for ConnectParamsBuilder {
    fn into_connect_params_builder(self) -> RelayResult<ConnectParamsBuilder> {
        Ok(self)
    }
}

impl IntoConnectParamsBuilder for &str {
    fn into_connect_params_builder(self) -> RelayResult<ConnectParamsBuilder> {
        cp_url::parse_url(self)
    }
}

impl IntoConnectParamsBuilder for String {
    fn into_connect_params_builder(self) -> RelayResult<ConnectParamsBuilder> {
        self.as_str().into_connect_params_builder()
    }
}
