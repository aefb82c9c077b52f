//! Central identity types for the session reconciliation core.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod provider;

pub use principal::{Identity, Provenance, Role};
pub use session::{AuthChange, AuthEvent, ExternalSession, IdentityRef, SessionMeta};
pub use provider::{
    ActivityEntry, ActivityLog, Credentials, IdentityProvider, ProfileRecord, ProfileStore,
    SignUpRequest,
};
