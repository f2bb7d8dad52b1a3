//! Multi-tenant credential verification.
//!
//! Each tenant contributes one verifier built from config. A token is tried
//! against the verifiers in declaration order and the first acceptance wins;
//! adding a tenant is a config change, not a code change. Failed tokens are
//! never cached.

use crate::config::{AuthConfig, TenantConfig};
use flowgate_core::{FlowError, Principal};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use tracing::{debug, warn};

pub trait TenantVerifier: Send + Sync {
    fn tenant(&self) -> &str;
    /// `Some` when this tenant vouches for the token.
    fn verify(&self, token: &str) -> Option<Principal>;
}

/// HS256 verifier for one tenant's token issuer.
pub struct JwtTenantVerifier {
    tenant: String,
    key: DecodingKey,
    validation: Validation,
}

impl JwtTenantVerifier {
    pub fn new(config: &TenantConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        Self {
            tenant: config.id.clone(),
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

impl TenantVerifier for JwtTenantVerifier {
    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn verify(&self, token: &str) -> Option<Principal> {
        let data = decode::<serde_json::Value>(token, &self.key, &self.validation).ok()?;
        let claims = data.claims;
        let subject = claims.get("sub")?.as_str()?.to_string();
        let email = claims
            .get("email")
            .and_then(|value| value.as_str())
            .map(str::to_string);
        Some(Principal {
            subject,
            email,
            tenant: self.tenant.clone(),
            claims,
        })
    }
}

/// Ordered verifier chain plus the organization-domain policy.
pub struct IdentityGate {
    verifiers: Vec<Box<dyn TenantVerifier>>,
    org_domain: Option<String>,
    enforce_domain: bool,
}

impl IdentityGate {
    pub fn new(config: &AuthConfig) -> Self {
        let verifiers = config
            .tenants
            .iter()
            .map(|tenant| Box::new(JwtTenantVerifier::new(tenant)) as Box<dyn TenantVerifier>)
            .collect();
        Self {
            verifiers,
            org_domain: config.org_domain.clone(),
            enforce_domain: config.enforce_domain,
        }
    }

    pub fn with_verifiers(
        verifiers: Vec<Box<dyn TenantVerifier>>,
        org_domain: Option<String>,
        enforce_domain: bool,
    ) -> Self {
        Self {
            verifiers,
            org_domain,
            enforce_domain,
        }
    }

    /// No tenants configured means the gate stays open.
    pub fn is_open(&self) -> bool {
        self.verifiers.is_empty()
    }

    /// Try each tenant in order; the first acceptance short-circuits the
    /// rest. Exhaustion is an authentication failure.
    pub fn authenticate(&self, token: &str) -> Result<Principal, FlowError> {
        for verifier in &self.verifiers {
            if let Some(principal) = verifier.verify(token) {
                debug!(
                    tenant = verifier.tenant(),
                    subject = %principal.subject,
                    "credential verified"
                );
                return self.check_domain(principal);
            }
        }
        Err(FlowError::Authentication(
            "no tenant accepted credential".into(),
        ))
    }

    /// Principals outside the organization domain are logged; they are only
    /// rejected when enforcement is switched on.
    fn check_domain(&self, principal: Principal) -> Result<Principal, FlowError> {
        let Some(domain) = &self.org_domain else {
            return Ok(principal);
        };
        if principal.in_domain(domain) {
            return Ok(principal);
        }
        if self.enforce_domain {
            warn!(
                subject = %principal.subject,
                email = ?principal.email,
                "principal outside organization domain rejected"
            );
            return Err(FlowError::Authorization(
                "account is outside the organization domain".into(),
            ));
        }
        warn!(
            subject = %principal.subject,
            email = ?principal.email,
            "principal outside organization domain"
        );
        Ok(principal)
    }
}
