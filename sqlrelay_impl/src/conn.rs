mod params;
pub mod placeholder;

pub use params::{
    validate_backend_url, ConnectParams, ConnectParamsBuilder, IntoConnectParams,
    IntoConnectParamsBuilder,
};
