//! Security services.

pub mod mfa;
pub mod rbac;
pub mod threat;
pub mod webauthn;

pub use mfa::{MfaService, TotpSetup};
pub use rbac::{Permission, RbacService, RequestContext, Role};
pub use threat::{AnomalyAssessment, LoginRiskAssessment, ThreatService};
pub use webauthn::{DeviceSummary, WebAuthnService};
