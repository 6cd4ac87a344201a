//! URL parsing and formatting for connection parameters.
//!
//! The datasource name in parentheses makes the authority section
//! unparseable for generic URL libraries, so the authority is taken apart by
//! hand; the back-end URL is everything after the first `/` and is kept as an
//! opaque string (it may still contain `${…}` tokens).

use crate::{ConnectParamsBuilder, RelayError, RelayResult};

pub(crate) fn scheme(use_tls: bool) -> &'static str {
    if use_tls {
        crate::url::RELAYS
    } else {
        crate::url::RELAY
    }
}

pub(crate) fn parse_url(url: &str) -> RelayResult<ConnectParamsBuilder> {
    let (use_tls, rest) = if let Some(rest) = url.strip_prefix("relays://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("relay://") {
        (false, rest)
    } else {
        return Err(RelayError::conn_params(
            format!("URL \"{url}\" does not start with relay:// or relays://").into(),
        ));
    };

    let (authority, backend_url) = rest
        .split_once('/')
        .ok_or_else(|| RelayError::conn_params("URL has no back-end part".into()))?;
    if backend_url.is_empty() {
        return Err(RelayError::conn_params("URL has an empty back-end part".into()));
    }

    let mut builder = ConnectParamsBuilder::new()
        .tls(use_tls)
        .backend_url(backend_url);

    let hostport = match authority.rsplit_once('@') {
        Some((credentials, hostport)) => {
            let (user, password) = credentials.split_once(':').ok_or_else(|| {
                RelayError::conn_params("credentials must have the form user:password".into())
            })?;
            if user.is_empty() {
                return Err(RelayError::conn_params("user must not be empty".into()));
            }
            builder = builder.dbuser(user).password(password);
            hostport
        }
        None => authority,
    };

    let (hostport, o_datasource) = match hostport.split_once('(') {
        Some((hostport, datasource_part)) => {
            let datasource = datasource_part.strip_suffix(')').ok_or_else(|| {
                RelayError::conn_params("datasource name must be closed with ')'".into())
            })?;
            (hostport, Some(datasource))
        }
        None => (hostport, None),
    };

    let (host, port) = hostport
        .split_once(':')
        .ok_or_else(|| RelayError::conn_params("URL does not specify a port".into()))?;
    if host.is_empty() {
        return Err(RelayError::conn_params("host must not be empty".into()));
    }
    let port: u16 = port
        .parse()
        .map_err(|e| RelayError::conn_params(Box::new(e)))?;

    builder = builder.hostname(host).port(port);
    if let Some(datasource) = o_datasource {
        if datasource.is_empty() {
            return Err(RelayError::conn_params("datasource name must not be empty".into()));
        }
        builder = builder.datasource(datasource);
    }
    Ok(builder)
}

pub(crate) fn format_as_url(
    addr: &str,
    dbuser: &str,
    datasource: &str,
    backend_url: &str,
    is_xa: bool,
    use_tls: bool,
    f: &mut std::fmt::Formatter,
) -> std::fmt::Result {
    write!(f, "{}://{}@{}", scheme(use_tls), dbuser, addr)?;
    if datasource != crate::DEFAULT_DATASOURCE {
        write!(f, "({datasource})")?;
    }
    write!(f, "/{backend_url}")?;
    if is_xa {
        write!(f, " [xa]")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::parse_url;

    #[test]
    fn authority_without_credentials_parses() {
        let builder = parse_url("relay://h:1/pg://db").unwrap();
        assert_eq!("relay://h:1/pg://db", {
            // no user set, so to_url leaves out the credentials part
            builder.clone().to_url().unwrap()
        });
    }

    #[test]
    fn nested_slashes_stay_in_the_backend_url() {
        let builder = parse_url("relay://h:1/jdbc:oracle:thin:@//ora:1521/svc").unwrap();
        let params = builder.dbuser("u").password("p").build().unwrap();
        assert_eq!("jdbc:oracle:thin:@//ora:1521/svc", params.backend_url());
    }
}
