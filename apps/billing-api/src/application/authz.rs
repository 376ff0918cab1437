use super::{ApplicationError, middleware::AuthenticatedUser};
use billing_core::domain::user::Role;

#[derive(Debug, Clone)]
pub enum Requirement<'a> {
    AdminOnly,
    /// Admins, or the tenant linked to this flat.
    FlatAccess { flat_id: &'a str },
    /// Admins, or the user themselves.
    SelfOrAdmin { target_user_id: &'a str },
}

pub fn authorize(ctx: &AuthenticatedUser, req: Requirement<'_>) -> Result<(), ApplicationError> {
    if ctx.role == Role::Admin {
        return Ok(());
    }
    let allowed = match req {
        Requirement::AdminOnly => false,
        Requirement::FlatAccess { flat_id } => ctx.flat_id.as_deref() == Some(flat_id),
        Requirement::SelfOrAdmin { target_user_id } => ctx.user_id == target_user_id,
    };
    if allowed {
        Ok(())
    } else {
        Err(ApplicationError::Forbidden(
            "You do not have access to this resource".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: Role, flat_id: Option<&str>) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: "u1".to_string(),
            username: "someone".to_string(),
            role,
            flat_id: flat_id.map(str::to_string),
        }
    }

    #[test]
    fn admin_passes_everything() {
        let admin = ctx(Role::Admin, None);
        assert!(authorize(&admin, Requirement::AdminOnly).is_ok());
        assert!(authorize(&admin, Requirement::FlatAccess { flat_id: "f9" }).is_ok());
        assert!(authorize(&admin, Requirement::SelfOrAdmin { target_user_id: "u9" }).is_ok());
    }

    #[test]
    fn tenant_limited_to_own_flat_and_account() {
        let tenant = ctx(Role::Tenant, Some("f1"));
        assert!(authorize(&tenant, Requirement::AdminOnly).is_err());
        assert!(authorize(&tenant, Requirement::FlatAccess { flat_id: "f1" }).is_ok());
        assert!(authorize(&tenant, Requirement::FlatAccess { flat_id: "f2" }).is_err());
        assert!(authorize(&tenant, Requirement::SelfOrAdmin { target_user_id: "u1" }).is_ok());
        assert!(authorize(&tenant, Requirement::SelfOrAdmin { target_user_id: "u2" }).is_err());
    }

    #[test]
    fn unlinked_tenant_has_no_flat() {
        let tenant = ctx(Role::Tenant, None);
        assert!(authorize(&tenant, Requirement::FlatAccess { flat_id: "f1" }).is_err());
    }
}
