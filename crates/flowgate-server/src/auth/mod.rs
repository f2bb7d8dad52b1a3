pub mod middleware;
pub mod tenant;

pub use middleware::{auth_middleware, issue_cookie};
pub use tenant::{IdentityGate, JwtTenantVerifier, TenantVerifier};
