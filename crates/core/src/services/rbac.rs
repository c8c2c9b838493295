//! Role-based access control service.
//!
//! Roles and permissions are stored by id; users carry a set of role
//! bindings. Authorization is deny-by-default: a missing role, a missing
//! permission, a failing condition or any internal error each
//! independently deny. The decision itself is the pure [`evaluate`]
//! function, so it can be tested without a store.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use validator::Validate;
use vigil_common::{AppError, AppResult, SecurityEvent, SecurityEventSink};
use vigil_store::CredentialStore;

/// Index set of all role ids.
const ROLE_INDEX_KEY: &str = "rbac:roles";

/// Context fields evaluated against permission conditions.
pub type RequestContext = HashMap<String, serde_json::Value>;

/// A named bundle of permissions.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Role id.
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    /// Human-readable role name.
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    /// Ids of the permissions this role grants.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A grant of one action on one resource, optionally narrowed by
/// conditions.
///
/// Permissions are immutable once referenced by a role; to change one,
/// create a new permission under a new id.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Permission id.
    #[validate(length(min = 1, max = 64))]
    pub id: String,
    /// Resource the permission applies to.
    #[validate(length(min = 1, max = 100))]
    pub resource: String,
    /// Action the permission allows.
    #[validate(length(min = 1, max = 100))]
    pub action: String,
    /// Conditions that must all match the request context to grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<RequestContext>,
}

/// Decide whether the given roles grant `action` on `resource`.
///
/// Pure function of its inputs: deterministic and side-effect free, which
/// is what makes the authorization decision testable in isolation.
#[must_use]
pub fn evaluate(
    roles: &[Role],
    permissions: &HashMap<String, Permission>,
    resource: &str,
    action: &str,
    context: Option<&RequestContext>,
) -> bool {
    roles
        .iter()
        .flat_map(|role| role.permissions.iter())
        .filter_map(|id| permissions.get(id))
        .any(|permission| permission_matches(permission, resource, action, context))
}

fn permission_matches(
    permission: &Permission,
    resource: &str,
    action: &str,
    context: Option<&RequestContext>,
) -> bool {
    if permission.resource != resource || permission.action != action {
        return false;
    }

    match &permission.conditions {
        None => true,
        Some(conditions) => conditions.iter().all(|(key, expected)| {
            // A missing context field is a non-match.
            context
                .and_then(|ctx| ctx.get(key))
                .is_some_and(|actual| actual == expected)
        }),
    }
}

/// Service for role and permission management and authorization checks.
#[derive(Clone)]
pub struct RbacService {
    store: Arc<dyn CredentialStore>,
    events: Arc<dyn SecurityEventSink>,
}

fn role_key(role_id: &str) -> String {
    format!("rbac:role:{role_id}")
}

fn permission_key(permission_id: &str) -> String {
    format!("rbac:permission:{permission_id}")
}

fn user_roles_key(user_id: &str) -> String {
    format!("rbac:user:{user_id}")
}

impl RbacService {
    /// Create a new RBAC service.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, events: Arc<dyn SecurityEventSink>) -> Self {
        Self { store, events }
    }

    /// Check whether a user may perform `action` on `resource`.
    ///
    /// Never raises: internal errors are logged and deny. Every
    /// invocation, granted or denied, emits a `permission_check` event.
    pub async fn has_permission(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        context: Option<&RequestContext>,
    ) -> bool {
        let granted = match self
            .has_permission_inner(user_id, resource, action, context)
            .await
        {
            Ok(granted) => granted,
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    resource = %resource,
                    action = %action,
                    error = %err,
                    "Permission check failed closed"
                );
                false
            }
        };

        self.emit(
            "permission_check",
            json!({
                "userId": user_id,
                "resource": resource,
                "action": action,
                "granted": granted,
            }),
        )
        .await;

        granted
    }

    async fn has_permission_inner(
        &self,
        user_id: &str,
        resource: &str,
        action: &str,
        context: Option<&RequestContext>,
    ) -> AppResult<bool> {
        let role_ids = self.store.set_members(&user_roles_key(user_id)).await?;
        if role_ids.is_empty() {
            return Ok(false);
        }

        let mut roles = Vec::with_capacity(role_ids.len());
        for role_id in &role_ids {
            // A binding to a deleted role simply contributes nothing.
            if let Some(json) = self.store.get(&role_key(role_id)).await? {
                let role: Role = serde_json::from_str(&json).map_err(|e| {
                    AppError::MalformedStoredData(format!("Invalid role {role_id}: {e}"))
                })?;
                roles.push(role);
            }
        }

        let mut permissions = HashMap::new();
        for permission_id in roles.iter().flat_map(|r| r.permissions.iter()) {
            // A dangling permission id never matches.
            if let Some(json) = self.store.get(&permission_key(permission_id)).await? {
                let permission: Permission = serde_json::from_str(&json).map_err(|e| {
                    AppError::MalformedStoredData(format!(
                        "Invalid permission {permission_id}: {e}"
                    ))
                })?;
                permissions.insert(permission.id.clone(), permission);
            }
        }

        Ok(evaluate(&roles, &permissions, resource, action, context))
    }

    /// Create or replace a role definition.
    ///
    /// Listed permission ids are not checked for existence; they are
    /// resolved lazily at check time.
    pub async fn create_role(&self, role: &Role) -> AppResult<()> {
        role.validate()?;

        let json = serde_json::to_string(role)
            .map_err(|e| AppError::Internal(format!("Failed to serialize role: {e}")))?;
        self.store.set(&role_key(&role.id), &json).await?;
        self.store
            .set_add(ROLE_INDEX_KEY, &[role.id.clone()])
            .await?;

        self.emit("role_created", json!({ "roleId": role.id, "name": role.name }))
            .await;
        Ok(())
    }

    /// Create a permission definition.
    pub async fn create_permission(&self, permission: &Permission) -> AppResult<()> {
        permission.validate()?;

        let json = serde_json::to_string(permission)
            .map_err(|e| AppError::Internal(format!("Failed to serialize permission: {e}")))?;
        self.store
            .set(&permission_key(&permission.id), &json)
            .await?;

        self.emit(
            "permission_created",
            json!({
                "permissionId": permission.id,
                "resource": permission.resource,
                "action": permission.action,
            }),
        )
        .await;
        Ok(())
    }

    /// Add a role to a user's role set. Re-assigning is a no-op.
    pub async fn assign_role(&self, user_id: &str, role_id: &str) -> AppResult<()> {
        self.store
            .set_add(&user_roles_key(user_id), &[role_id.to_string()])
            .await?;

        self.emit(
            "role_assigned",
            json!({ "userId": user_id, "roleId": role_id }),
        )
        .await;
        Ok(())
    }

    /// Remove a role from a user's role set.
    pub async fn unassign_role(&self, user_id: &str, role_id: &str) -> AppResult<()> {
        let removed = self
            .store
            .set_remove(&user_roles_key(user_id), role_id)
            .await?;

        self.emit(
            "role_unassigned",
            json!({ "userId": user_id, "roleId": role_id, "removed": removed }),
        )
        .await;
        Ok(())
    }

    /// Ids of the roles bound to a user, sorted.
    pub async fn user_roles(&self, user_id: &str) -> AppResult<Vec<String>> {
        let mut role_ids = self.store.set_members(&user_roles_key(user_id)).await?;
        role_ids.sort();
        Ok(role_ids)
    }

    /// All known role definitions, sorted by id.
    pub async fn list_roles(&self) -> AppResult<Vec<Role>> {
        let role_ids = self.store.set_members(ROLE_INDEX_KEY).await?;

        let mut roles = Vec::with_capacity(role_ids.len());
        for role_id in &role_ids {
            if let Some(json) = self.store.get(&role_key(role_id)).await? {
                if let Ok(role) = serde_json::from_str::<Role>(&json) {
                    roles.push(role);
                }
            }
        }
        roles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(roles)
    }

    async fn emit(&self, category: &str, payload: serde_json::Value) {
        self.events.append(SecurityEvent::new(category, payload)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use vigil_common::CapturingEventSink;
    use vigil_store::MemoryCredentialStore;

    fn test_service() -> (RbacService, Arc<CapturingEventSink>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let events = Arc::new(CapturingEventSink::new());
        let service = RbacService::new(store, Arc::clone(&events) as Arc<dyn SecurityEventSink>);
        (service, events)
    }

    fn role(id: &str, permissions: &[&str]) -> Role {
        Role {
            id: id.to_string(),
            name: format!("{id} role"),
            permissions: permissions.iter().map(ToString::to_string).collect(),
        }
    }

    fn permission(id: &str, resource: &str, action: &str) -> Permission {
        Permission {
            id: id.to_string(),
            resource: resource.to_string(),
            action: action.to_string(),
            conditions: None,
        }
    }

    fn conditional_permission(
        id: &str,
        resource: &str,
        action: &str,
        conditions: RequestContext,
    ) -> Permission {
        Permission {
            conditions: Some(conditions),
            ..permission(id, resource, action)
        }
    }

    fn context(key: &str, value: &str) -> RequestContext {
        HashMap::from([(key.to_string(), json!(value))])
    }

    #[test]
    fn test_evaluate_deny_by_default() {
        let permissions = HashMap::new();
        assert!(!evaluate(&[], &permissions, "project", "read", None));

        // Role exists but grants nothing relevant.
        let roles = vec![role("viewer", &["p1"])];
        assert!(!evaluate(&roles, &permissions, "project", "read", None));
    }

    #[test]
    fn test_evaluate_grant_and_mismatches() {
        let roles = vec![role("viewer", &["p1"])];
        let permissions =
            HashMap::from([("p1".to_string(), permission("p1", "project", "read"))]);

        assert!(evaluate(&roles, &permissions, "project", "read", None));
        assert!(!evaluate(&roles, &permissions, "project", "write", None));
        assert!(!evaluate(&roles, &permissions, "document", "read", None));
    }

    #[test]
    fn test_evaluate_conditions_must_all_match() {
        let roles = vec![role("member", &["p1"])];
        let permissions = HashMap::from([(
            "p1".to_string(),
            conditional_permission("p1", "project", "read", context("projectId", "123")),
        )]);

        let matching = context("projectId", "123");
        let wrong_value = context("projectId", "456");
        let unrelated = context("teamId", "123");

        assert!(evaluate(&roles, &permissions, "project", "read", Some(&matching)));
        assert!(!evaluate(&roles, &permissions, "project", "read", Some(&wrong_value)));
        // Absence of the required context field is a non-match.
        assert!(!evaluate(&roles, &permissions, "project", "read", Some(&unrelated)));
        assert!(!evaluate(&roles, &permissions, "project", "read", None));
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let roles = vec![role("viewer", &["p1"])];
        let permissions =
            HashMap::from([("p1".to_string(), permission("p1", "project", "read"))]);

        let first = evaluate(&roles, &permissions, "project", "read", None);
        let second = evaluate(&roles, &permissions, "project", "read", None);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_has_permission_full_resolution() {
        let (service, _) = test_service();

        service
            .create_permission(&permission("p.read", "project", "read"))
            .await
            .unwrap();
        service.create_role(&role("viewer", &["p.read"])).await.unwrap();
        service.assign_role("u1", "viewer").await.unwrap();

        assert!(service.has_permission("u1", "project", "read", None).await);
        assert!(!service.has_permission("u1", "project", "delete", None).await);
        assert!(!service.has_permission("u2", "project", "read", None).await);
    }

    #[tokio::test]
    async fn test_conditional_permission_narrows_grant() {
        let (service, _) = test_service();

        service
            .create_permission(&conditional_permission(
                "p.read.123",
                "project",
                "read",
                context("projectId", "123"),
            ))
            .await
            .unwrap();
        service
            .create_role(&role("project-member", &["p.read.123"]))
            .await
            .unwrap();
        service.assign_role("u1", "project-member").await.unwrap();

        let matching = context("projectId", "123");
        let wrong = context("projectId", "999");

        assert!(
            service
                .has_permission("u1", "project", "read", Some(&matching))
                .await
        );
        assert!(
            !service
                .has_permission("u1", "project", "read", Some(&wrong))
                .await
        );
        assert!(!service.has_permission("u1", "project", "read", None).await);
    }

    #[tokio::test]
    async fn test_dangling_permission_never_matches() {
        let (service, _) = test_service();

        // Role references a permission that was never created.
        service.create_role(&role("broken", &["ghost"])).await.unwrap();
        service.assign_role("u1", "broken").await.unwrap();

        assert!(!service.has_permission("u1", "project", "read", None).await);
    }

    #[tokio::test]
    async fn test_assign_role_is_idempotent() {
        let (service, _) = test_service();

        service.assign_role("u1", "viewer").await.unwrap();
        service.assign_role("u1", "viewer").await.unwrap();

        assert_eq!(service.user_roles("u1").await.unwrap(), vec!["viewer"]);
    }

    #[tokio::test]
    async fn test_unassign_role_revokes_access() {
        let (service, _) = test_service();

        service
            .create_permission(&permission("p.read", "project", "read"))
            .await
            .unwrap();
        service.create_role(&role("viewer", &["p.read"])).await.unwrap();
        service.assign_role("u1", "viewer").await.unwrap();
        assert!(service.has_permission("u1", "project", "read", None).await);

        service.unassign_role("u1", "viewer").await.unwrap();
        assert!(!service.has_permission("u1", "project", "read", None).await);
        assert!(service.user_roles("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_check_emits_an_event() {
        let (service, events) = test_service();

        service.has_permission("u1", "project", "read", None).await;

        service
            .create_permission(&permission("p.read", "project", "read"))
            .await
            .unwrap();
        service.create_role(&role("viewer", &["p.read"])).await.unwrap();
        service.assign_role("u1", "viewer").await.unwrap();
        service.has_permission("u1", "project", "read", None).await;

        let checks = events.events_in("permission_check");
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].payload["granted"], false);
        assert_eq!(checks[1].payload["granted"], true);
    }

    #[tokio::test]
    async fn test_create_role_validates_input() {
        let (service, _) = test_service();

        let invalid = Role {
            id: String::new(),
            name: "Empty id".to_string(),
            permissions: Vec::new(),
        };
        assert!(service.create_role(&invalid).await.is_err());
    }

    #[tokio::test]
    async fn test_list_roles_sorted() {
        let (service, _) = test_service();

        service.create_role(&role("zeta", &[])).await.unwrap();
        service.create_role(&role("alpha", &[])).await.unwrap();

        let roles = service.list_roles().await.unwrap();
        let ids: Vec<_> = roles.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
