use smol_str::SmolStr;

/// SIP request methods the proxy routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Message,
    Subscribe,
    Notify,
    Refer,
    Info,
    Update,
    Publish,
    Unknown(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Publish => "PUBLISH",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token, returning `Unknown` for extension methods.
    pub fn from_token(token: &str) -> Self {
        match () {
            _ if token.eq_ignore_ascii_case("INVITE") => Method::Invite,
            _ if token.eq_ignore_ascii_case("ACK") => Method::Ack,
            _ if token.eq_ignore_ascii_case("BYE") => Method::Bye,
            _ if token.eq_ignore_ascii_case("CANCEL") => Method::Cancel,
            _ if token.eq_ignore_ascii_case("REGISTER") => Method::Register,
            _ if token.eq_ignore_ascii_case("OPTIONS") => Method::Options,
            _ if token.eq_ignore_ascii_case("MESSAGE") => Method::Message,
            _ if token.eq_ignore_ascii_case("SUBSCRIBE") => Method::Subscribe,
            _ if token.eq_ignore_ascii_case("NOTIFY") => Method::Notify,
            _ if token.eq_ignore_ascii_case("REFER") => Method::Refer,
            _ if token.eq_ignore_ascii_case("INFO") => Method::Info,
            _ if token.eq_ignore_ascii_case("UPDATE") => Method::Update,
            _ if token.eq_ignore_ascii_case("PUBLISH") => Method::Publish,
            _ => Method::Unknown(SmolStr::new(token)),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tokens_case_insensitively() {
        assert_eq!(Method::from_token("invite"), Method::Invite);
        assert_eq!(Method::from_token("MESSAGE"), Method::Message);
        assert_eq!(Method::from_token("Cancel"), Method::Cancel);
    }

    #[test]
    fn keeps_extension_methods() {
        let m = Method::from_token("CHECKPOINT");
        assert_eq!(m, Method::Unknown(SmolStr::new("CHECKPOINT")));
        assert_eq!(m.as_str(), "CHECKPOINT");
    }
}
