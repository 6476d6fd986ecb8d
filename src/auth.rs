//! Authorization capabilities consulted by wrapped resolvers.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::handler::FieldInfo;
use crate::loader::BoxFuture;
use crate::scope::{CurrentRequest, RequestScope};

/// Identity and roles of whoever issued the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// What a role checker gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct Action<'a> {
    pub principal: Option<&'a Principal>,
    pub scope: &'a RequestScope,
    pub field: &'a FieldInfo,
}

pub trait RoleChecker: Send + Sync {
    /// Returns `Ok(false)` to deny. Errors are reported as resolver failures.
    fn check<'a>(&'a self, action: Action<'a>, roles: &'a [String]) -> BoxFuture<'a, anyhow::Result<bool>>;
}

/// Grants access when the principal holds at least one of the roles.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyRoleChecker;

impl RoleChecker for AnyRoleChecker {
    fn check<'a>(&'a self, action: Action<'a>, roles: &'a [String]) -> BoxFuture<'a, anyhow::Result<bool>> {
        let granted = action
            .principal
            .map(|principal| roles.iter().any(|role| principal.has_role(role)))
            .unwrap_or(false);
        Box::pin(async move { Ok(granted) })
    }
}

/// Grants access when the principal holds every one of the roles.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllRolesChecker;

impl RoleChecker for AllRolesChecker {
    fn check<'a>(&'a self, action: Action<'a>, roles: &'a [String]) -> BoxFuture<'a, anyhow::Result<bool>> {
        let granted = action
            .principal
            .map(|principal| roles.iter().all(|role| principal.has_role(role)))
            .unwrap_or(false);
        Box::pin(async move { Ok(granted) })
    }
}

pub fn default_role_checker() -> Arc<dyn RoleChecker> {
    Arc::new(AnyRoleChecker)
}

/// Derives the principal of an incoming request.
pub trait PrincipalResolver: Send + Sync {
    fn resolve<'a>(&'a self, request: &'a CurrentRequest) -> BoxFuture<'a, anyhow::Result<Option<Principal>>>;
}

/// Reads the principal from headers set by a trusted upstream proxy.
///
/// Only use behind something that strips these headers from client traffic.
#[derive(Debug, Clone)]
pub struct HeaderPrincipalResolver {
    pub id_header: String,
    pub roles_header: String,
}

impl Default for HeaderPrincipalResolver {
    fn default() -> Self {
        Self {
            id_header: "x-principal-id".to_string(),
            roles_header: "x-principal-roles".to_string(),
        }
    }
}

impl PrincipalResolver for HeaderPrincipalResolver {
    fn resolve<'a>(&'a self, request: &'a CurrentRequest) -> BoxFuture<'a, anyhow::Result<Option<Principal>>> {
        Box::pin(async move {
            let Some(id) = request.header(&self.id_header) else {
                return Ok(None);
            };
            let roles = request
                .header(&self.roles_header)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|role| !role.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Some(Principal {
                id: id.to_string(),
                roles,
            }))
        })
    }
}
