//! Security Context Resolution
//!
//! Turns the gateway-supplied user context into a [`SecurityContext`]. The
//! pipeline never derives scope; it only refuses contexts that break the
//! catalog and store-scoping invariants.

use crate::types::{SecurityContext, ViewCatalog};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("role is required")]
    MissingRole,

    #[error("role '{0}' requires a positive store_id")]
    StoreRequired(String),

    #[error("view '{0}' is not in the view catalog")]
    UnknownView(String),
}

#[derive(Debug, Clone)]
pub struct ScopePolicy {
    catalog: ViewCatalog,
    unscoped_roles: Vec<String>,
}

impl ScopePolicy {
    pub fn new(catalog: ViewCatalog, unscoped_roles: Vec<String>) -> Self {
        Self {
            catalog,
            unscoped_roles: unscoped_roles.into_iter().map(|r| r.to_lowercase()).collect(),
        }
    }

    pub fn catalog(&self) -> &ViewCatalog {
        &self.catalog
    }

    pub fn requires_store(&self, role: &str) -> bool {
        !self.unscoped_roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    pub fn resolve(
        &self,
        role: &str,
        store_id: i64,
        allowed_views: &[String],
    ) -> Result<SecurityContext, ScopeError> {
        let role = role.trim();
        if role.is_empty() {
            return Err(ScopeError::MissingRole);
        }
        if self.requires_store(role) && store_id <= 0 {
            return Err(ScopeError::StoreRequired(role.to_string()));
        }

        let mut views: Vec<String> = Vec::with_capacity(allowed_views.len());
        for view in allowed_views {
            let view = view.trim();
            if !self.catalog.contains(view) {
                return Err(ScopeError::UnknownView(view.to_string()));
            }
            if !views.iter().any(|v| v.eq_ignore_ascii_case(view)) {
                views.push(view.to_string());
            }
        }

        Ok(SecurityContext {
            role: role.to_string(),
            store_id,
            allowed_views: views,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScopePolicy {
        ScopePolicy::new(
            ViewCatalog::new(["v_payment_scoped", "v_customer_masked"]),
            vec!["Admin".to_string()],
        )
    }

    #[test]
    fn test_resolves_valid_context() {
        let ctx = policy()
            .resolve("store_manager", 1, &["v_payment_scoped".to_string(), "v_payment_scoped".to_string()])
            .unwrap();
        assert_eq!(ctx.role(), "store_manager");
        assert_eq!(ctx.allowed_views(), ["v_payment_scoped".to_string()]);
    }

    #[test]
    fn test_rejects_view_outside_catalog() {
        let err = policy().resolve("store_manager", 1, &["customer".to_string()]).unwrap_err();
        assert_eq!(err, ScopeError::UnknownView("customer".to_string()));
    }

    #[test]
    fn test_store_scoping() {
        assert_eq!(
            policy().resolve("store_manager", 0, &[]).unwrap_err(),
            ScopeError::StoreRequired("store_manager".to_string())
        );
        assert!(policy().resolve("admin", 0, &[]).is_ok());
        assert_eq!(policy().resolve("  ", 1, &[]).unwrap_err(), ScopeError::MissingRole);
    }
}
