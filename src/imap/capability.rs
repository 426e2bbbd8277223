/// Capability advertisement. The set varies with the TLS posture of
/// the connection: before STARTTLS on an upgradable listener, LOGIN is
/// disabled and STARTTLS is offered.
#[derive(Clone, Copy, Debug)]
pub struct ServerCapability {
    pub starttls: bool,
    pub login_disabled: bool,
}

impl ServerCapability {
    pub fn new(tls_configured: bool, secure: bool) -> Self {
        ServerCapability {
            starttls: tls_configured && !secure,
            login_disabled: tls_configured && !secure,
        }
    }

    pub fn to_vec(self) -> Vec<String> {
        let mut caps: Vec<String> = [
            "IMAP4rev1",
            "LITERAL+",
            "SASL-IR",
            "CHILDREN",
            "UNSELECT",
            "MOVE",
            "IDLE",
            "APPENDLIMIT",
            "AUTH=PLAIN",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect();
        if self.starttls {
            caps.push("STARTTLS".to_string());
        }
        if self.login_disabled {
            caps.push("LOGINDISABLED".to_string());
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_with_tls_configured_hides_login() {
        let caps = ServerCapability::new(true, false).to_vec();
        assert!(caps.contains(&"STARTTLS".to_string()));
        assert!(caps.contains(&"LOGINDISABLED".to_string()));
    }

    #[test]
    fn secure_connection_allows_login() {
        let caps = ServerCapability::new(true, true).to_vec();
        assert!(!caps.contains(&"STARTTLS".to_string()));
        assert!(!caps.contains(&"LOGINDISABLED".to_string()));
        assert!(caps.contains(&"IMAP4rev1".to_string()));
        assert!(caps.contains(&"MOVE".to_string()));
    }
}
