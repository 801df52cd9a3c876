use smol_str::SmolStr;

/// Errors produced while parsing a SIP URI.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("unsupported scheme in `{0}`")]
    UnsupportedScheme(String),
    #[error("missing host in `{0}`")]
    MissingHost(String),
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
}

/// A parsed `sip:` / `sips:` URI.
///
/// Covers the subset a proxy routes on: optional user, host, optional port
/// and URI parameters. Anything the transport layer cares about (headers,
/// embedded bodies) stays with the external stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    secure: bool,
    user: Option<SmolStr>,
    host: SmolStr,
    port: Option<u16>,
    params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl SipUri {
    /// Parses `sip:[user@]host[:port][;param[=value]]*`.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let (secure, rest) = if let Some(rest) = strip_scheme(input, "sips:") {
            (true, rest)
        } else if let Some(rest) = strip_scheme(input, "sip:") {
            (false, rest)
        } else {
            return Err(UriError::UnsupportedScheme(input.to_owned()));
        };

        let (addr, param_str) = match rest.split_once(';') {
            Some((addr, params)) => (addr, Some(params)),
            None => (rest, None),
        };

        let (user, host_port) = match addr.rsplit_once('@') {
            Some((user, host_port)) => (Some(SmolStr::new(user)), host_port),
            None => (None, addr),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            // Only treat the suffix as a port when it is all digits, so IPv6
            // references without a port still parse as a bare host.
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| UriError::InvalidPort(input.to_owned()))?;
                (host, Some(port))
            }
            _ => (host_port, None),
        };
        if host.is_empty() {
            return Err(UriError::MissingHost(input.to_owned()));
        }

        let params = param_str
            .map(|raw| {
                raw.split(';')
                    .filter(|p| !p.is_empty())
                    .map(|p| match p.split_once('=') {
                        Some((name, value)) => (SmolStr::new(name), Some(SmolStr::new(value))),
                        None => (SmolStr::new(p), None),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            secure,
            user,
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Returns `true` for `sips:` URIs.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Returns the user part, if present.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the explicit port, if present.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns the port to contact, defaulting per scheme.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.secure { 5061 } else { 5060 })
    }

    /// Looks up a URI parameter value; `Some(None)` for valueless params.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Compares the routing destination of two URIs: same host and port,
    /// transport ignored.
    pub fn same_destination(&self, other: &SipUri) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port_or_default() == other.port_or_default()
    }
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = input.as_bytes().get(..scheme.len())?;
    if prefix.eq_ignore_ascii_case(scheme.as_bytes()) {
        Some(&input[scheme.len()..])
    } else {
        None
    }
}

impl std::fmt::Display for SipUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = SipUri::parse("sip:alice@example.com:5070;transport=tcp;lr").unwrap();
        assert_eq!(uri.user(), Some("alice"));
        assert_eq!(uri.host(), "example.com");
        assert_eq!(uri.port(), Some(5070));
        assert_eq!(uri.param("transport"), Some(Some("tcp")));
        assert_eq!(uri.param("lr"), Some(None));
        assert!(!uri.is_secure());
    }

    #[test]
    fn parses_bare_host() {
        let uri = SipUri::parse("sip:proxy.example.com").unwrap();
        assert_eq!(uri.user(), None);
        assert_eq!(uri.port_or_default(), 5060);
    }

    #[test]
    fn sips_defaults_to_5061() {
        let uri = SipUri::parse("sips:bob@example.com").unwrap();
        assert!(uri.is_secure());
        assert_eq!(uri.port_or_default(), 5061);
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            SipUri::parse("tel:+15551234567"),
            Err(UriError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn same_destination_ignores_user_and_params() {
        let a = SipUri::parse("sip:alice@192.168.1.10:5060;transport=udp").unwrap();
        let b = SipUri::parse("sip:bob@192.168.1.10").unwrap();
        let c = SipUri::parse("sip:bob@192.168.1.10:5070").unwrap();
        assert!(a.same_destination(&b));
        assert!(!a.same_destination(&c));
    }

    #[test]
    fn display_round_trips() {
        let text = "sip:alice@example.com:5070;transport=tcp";
        let uri = SipUri::parse(text).unwrap();
        assert_eq!(uri.to_string(), text);
    }
}
