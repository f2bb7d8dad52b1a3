use serde::{Deserialize, Serialize};

/// Verified caller identity. Produced by the identity gate once per request
/// and carried through request extensions; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Stable subject identifier from the verified credential.
    pub subject: String,
    pub email: Option<String>,
    /// Tenant whose verifier accepted the credential.
    pub tenant: String,
    /// Remaining claims, kept opaque for audit logging.
    pub claims: serde_json::Value,
}

impl Principal {
    /// Key used for per-caller rate accounting.
    pub fn rate_key(&self) -> &str {
        &self.subject
    }

    /// Whether the principal's email falls under the given organization
    /// domain. Principals without an email never match.
    pub fn in_domain(&self, domain: &str) -> bool {
        self.email
            .as_deref()
            .map(|email| {
                email
                    .rsplit('@')
                    .next()
                    .is_some_and(|host| host.eq_ignore_ascii_case(domain))
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(email: Option<&str>) -> Principal {
        Principal {
            subject: "user-1".into(),
            email: email.map(str::to_string),
            tenant: "acme".into(),
            claims: serde_json::json!({}),
        }
    }

    #[test]
    fn domain_check_is_case_insensitive() {
        assert!(principal(Some("dev@Example.COM")).in_domain("example.com"));
        assert!(!principal(Some("dev@other.com")).in_domain("example.com"));
    }

    #[test]
    fn missing_email_never_matches() {
        assert!(!principal(None).in_domain("example.com"));
    }
}
