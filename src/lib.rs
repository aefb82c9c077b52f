pub mod error;
pub mod identity;
pub mod storage;
pub mod profile;
pub mod validator;
pub mod reconciler;
