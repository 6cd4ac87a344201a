use super::cp_url;
use crate::{protocol::parts::EndpointAddr, ConnectParams, RelayError, RelayResult};
use secstr::SecUtf8;
use std::collections::HashMap;

/// A builder for [`ConnectParams`](crate::ConnectParams).
///
/// An instance can be directly created, or from a URL
/// (see [`IntoConnectParamsBuilder`](crate::IntoConnectParamsBuilder)).
///
/// ```rust
/// use sqlrelay_impl::ConnectParamsBuilder;
///
/// let connect_params = ConnectParamsBuilder::new()
///     .hostname("proxy1")
///     .port(1528)
///     .endpoint("proxy2", 1528)
///     .backend_url("postgresql://db:5432/app")
///     .dbuser("MEIER")
///     .password("schLau")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectParamsBuilder {
    hostname: Option<String>,
    port: Option<u16>,
    additional_endpoints: Vec<EndpointAddr>,
    datasource: Option<String>,
    backend_url: Option<String>,
    dbuser: Option<String>,
    password: Option<SecUtf8>,
    is_xa: bool,
    use_tls: bool,
    properties: HashMap<String, String>,
}

impl ConnectParamsBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hostname of the primary proxy endpoint.
    pub fn hostname<H: AsRef<str>>(mut self, hostname: H) -> Self {
        self.hostname = Some(hostname.as_ref().to_owned());
        self
    }

    /// Sets the port of the primary proxy endpoint.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Adds an additional proxy endpoint for multi-node operation.
    pub fn endpoint<H: AsRef<str>>(mut self, hostname: H, port: u16) -> Self {
        self.additional_endpoints
            .push(EndpointAddr::new(hostname.as_ref().to_owned(), port));
        self
    }

    /// Sets the logical datasource name; defaults to `default`.
    pub fn datasource<D: AsRef<str>>(mut self, datasource: D) -> Self {
        self.datasource = Some(datasource.as_ref().to_owned());
        self
    }

    /// Sets the back-end database URL; `${…}` tokens are kept verbatim and
    /// resolved server-side.
    pub fn backend_url<U: AsRef<str>>(mut self, backend_url: U) -> Self {
        self.backend_url = Some(backend_url.as_ref().to_owned());
        self
    }

    /// Sets the database user.
    pub fn dbuser<D: AsRef<str>>(mut self, dbuser: D) -> Self {
        self.dbuser = Some(dbuser.as_ref().to_owned());
        self
    }

    /// Sets the password.
    pub fn password<P: AsRef<str>>(mut self, pw: P) -> Self {
        self.password = Some(SecUtf8::from(pw.as_ref()));
        self
    }

    /// Unsets the password.
    pub fn unset_password(mut self) -> Self {
        self.password = None;
        self
    }

    /// Makes sessions participate in distributed (XA) transactions.
    pub fn xa(mut self, is_xa: bool) -> Self {
        self.is_xa = is_xa;
        self
    }

    /// Wraps the wire connection in TLS.
    pub fn tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Adds a free-form property that is forwarded to the pool provider.
    pub fn property<K: AsRef<str>, V: AsRef<str>>(mut self, key: K, value: V) -> Self {
        self.properties
            .insert(key.as_ref().to_owned(), value.as_ref().to_owned());
        self
    }

    /// Constructs a `ConnectParams` from the builder.
    ///
    /// # Errors
    /// `RelayError::Usage` if a mandatory field was not provided.
    pub fn build(self) -> RelayResult<ConnectParams> {
        let host = self
            .hostname
            .ok_or(RelayError::Usage("hostname is missing"))?;
        let port = self.port.ok_or(RelayError::Usage("port is missing"))?;
        let backend_url = self
            .backend_url
            .ok_or(RelayError::Usage("backend url is missing"))?;
        let dbuser = self.dbuser.ok_or(RelayError::Usage("dbuser is missing"))?;
        let password = self
            .password
            .ok_or(RelayError::Usage("password is missing"))?;
        Ok(ConnectParams::new(
            host,
            port,
            self.additional_endpoints,
            self.datasource,
            backend_url,
            dbuser,
            password,
            self.is_xa,
            self.use_tls,
            self.properties,
        ))
    }

    /// Constructs a URL from the builder; the password is omitted.
    pub fn to_url(&self) -> RelayResult<String> {
        if let (Some(hostname), Some(port), Some(backend_url)) =
            (&self.hostname, self.port, &self.backend_url)
        {
            let mut url = String::with_capacity(200);
            url.push_str(cp_url::scheme(self.use_tls));
            url.push_str("://");
            if let Some(dbuser) = &self.dbuser {
                url.push_str(dbuser);
                url.push('@');
            }
            url.push_str(hostname);
            url.push(':');
            url.push_str(&port.to_string());
            if let Some(datasource) = &self.datasource {
                url.push('(');
                url.push_str(datasource);
                url.push(')');
            }
            url.push('/');
            url.push_str(backend_url);
            Ok(url)
        } else {
            Err(RelayError::Usage(
                "URL requires hostname, port, and backend url",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectParamsBuilder;
    use crate::IntoConnectParamsBuilder;

    #[test]
    fn test_builder() {
        let params = ConnectParamsBuilder::new()
            .hostname("proxy1")
            .port(1528)
            .endpoint("proxy2", 1529)
            .datasource("orders")
            .backend_url("postgresql://db:5432/app")
            .dbuser("MEIER")
            .password("schLau")
            .xa(true)
            .property("connection.pool.maximumPoolSize", "5")
            .build()
            .unwrap();

        assert_eq!("proxy1:1528", params.addr());
        assert_eq!(2, params.endpoints().len());
        assert_eq!("orders", params.datasource());
        assert!(params.is_xa());
        assert_eq!(
            "5",
            params.properties()["connection.pool.maximumPoolSize"]
        );
    }

    #[test]
    fn test_builder_from_url() {
        let builder = "relay://abcd123:1528(orders)/postgresql://db:5432/app"
            .into_connect_params_builder()
            .unwrap();
        assert!(builder.clone().build().is_err()); // no credentials yet
        let params = builder.dbuser("MEIER").password("schLau").build().unwrap();
        assert_eq!("orders", params.datasource());
    }

    #[test]
    fn test_to_url() {
        let builder = ConnectParamsBuilder::new()
            .hostname("h")
            .port(1)
            .datasource("d")
            .backend_url("pg://db")
            .dbuser("u")
            .password("secret");
        assert_eq!("relay://u@h:1(d)/pg://db", builder.to_url().unwrap());
    }
}
