//! Role-based access control: the role/permission matrix and bearer-token
//! header parsing. This crate is the contract boundary; token issuance and
//! verification live with the deployment, not here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    ReadWrite,
    ReadOnly,
    NoAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    DbRead,
    DbCreate,
    DbDelete,
    CollectionCreate,
    CollectionDelete,
    DocRead,
    DocWrite,
    DocDelete,
    /// Admin-only endpoints such as audit log access.
    AdminRead,
}

impl Role {
    /// The static permission matrix. Admin holds everything; NoAccess
    /// nothing.
    pub fn has_permission(self, permission: Permission) -> bool {
        match self {
            Role::Admin => true,
            Role::ReadWrite => matches!(
                permission,
                Permission::DocRead
                    | Permission::DocWrite
                    | Permission::DocDelete
                    | Permission::CollectionCreate
            ),
            Role::ReadOnly => matches!(permission, Permission::DocRead | Permission::DbRead),
            Role::NoAccess => false,
        }
    }

    /// Map a role string (token metadata) to a role. Unknown strings get no
    /// access.
    pub fn from_name(name: &str) -> Role {
        match name {
            "admin" => Role::Admin,
            "readwrite" => Role::ReadWrite,
            "readonly" => Role::ReadOnly,
            _ => Role::NoAccess,
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header_value: &str) -> Option<&str> {
    let rest = header_value.strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
