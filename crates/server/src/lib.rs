pub mod audit;
pub mod kms;
pub mod service;

pub use crate::{
    audit::{AuditEntry, AuditEventKind, AuditLog},
    kms::{Kms, KmsError},
    service::QueryService,
};
