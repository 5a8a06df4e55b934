use std::fmt;

use crate::error::Error;

/// `http` or `https`, the only two schemes this pool accepts at its
/// boundary (§3, §7 `UnsupportedProtocol`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(s: &str) -> Result<Scheme, Error> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            _ => Err(Error::UnsupportedProtocol),
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(scheme, host, port)` — the pool's partitioning key.
///
/// Equality is by all three components. The pool does not normalize host
/// case; callers are expected to hand in an already-canonical host.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: Box<str>,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<Box<str>>, port: u16) -> Origin {
        Origin {
            scheme,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl Origin {
    /// The rendering `get_connection_info()` keys its map by (§4.7):
    /// default ports are omitted, matching how a browser address bar
    /// would show the origin.
    pub fn render_url(&self) -> String {
        if self.port == self.scheme.default_port() {
            format!("{}://{}/", self.scheme, self.host)
        } else {
            format!("{}://{}:{}/", self.scheme, self.host, self.port)
        }
    }
}

/// `(scheme, host, port, path)` — a request target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: Box<str>,
    pub port: Option<u16>,
    pub path: Box<str>,
}

impl Url {
    /// Constructs a `Url`, validating the two pool preconditions from §4.1:
    /// the scheme must be `http`/`https` and the host must be non-empty.
    /// Both checks happen here, before any pool state is touched.
    pub fn new(
        scheme: &str,
        host: impl Into<Box<str>>,
        port: Option<u16>,
        path: impl Into<Box<str>>,
    ) -> Result<Url, Error> {
        let scheme = Scheme::parse(scheme)?;
        let host = host.into();
        if host.is_empty() {
            return Err(Error::LocalProtocolError("missing hostname in URL"));
        }
        Ok(Url {
            scheme,
            host,
            port,
            path: path.into(),
        })
    }

    pub fn origin(&self) -> Origin {
        Origin::new(
            self.scheme,
            self.host.clone(),
            self.port.unwrap_or_else(|| self.scheme.default_port()),
        )
    }

    /// Builds a `Url` from an [`http::Uri`], the entrypoint used by
    /// [`crate::pool::Pool::request`] — the boundary surface's `url`
    /// parameter, rendered in the idiomatic Rust shape callers already have
    /// on hand from an `http::Request`.
    pub fn from_uri(uri: &http::Uri) -> Result<Url, Error> {
        let scheme = uri.scheme_str().ok_or(Error::UnsupportedProtocol)?;
        let host = uri.host().unwrap_or("");
        let port = uri.port_u16();
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Url::new(scheme, host, port, path)
    }

    /// Renders the absolute-form target used by forward-proxy requests:
    /// `scheme://host[:port]path`.
    pub fn absolute_form(&self) -> String {
        match self.port {
            Some(port) if port != self.scheme.default_port() => {
                format!("{}://{}:{}{}", self.scheme, self.host, port, self.path)
            }
            _ => format!("{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.absolute_form())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_scheme() {
        assert!(matches!(
            Url::new("ftp", "a.test", None, "/"),
            Err(Error::UnsupportedProtocol)
        ));
    }

    #[test]
    fn rejects_empty_host() {
        assert!(matches!(
            Url::new("http", "", None, "/"),
            Err(Error::LocalProtocolError(_))
        ));
    }

    #[test]
    fn origin_uses_default_port() {
        let url = Url::new("https", "a.test", None, "/").unwrap();
        assert_eq!(url.origin(), Origin::new(Scheme::Https, "a.test", 443));
    }

    #[test]
    fn absolute_form_omits_default_port() {
        let url = Url::new("http", "a.test", Some(80), "/x").unwrap();
        assert_eq!(url.absolute_form(), "http://a.test/x");
        let url = Url::new("http", "a.test", Some(8080), "/x").unwrap();
        assert_eq!(url.absolute_form(), "http://a.test:8080/x");
    }
}
