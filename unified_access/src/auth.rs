//! Caller identity
//!
//! Credential issuance is handled elsewhere; this layer only consumes the
//! resulting principal and its permission set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Operation class used in permission codenames (`"{model}:{action}"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    /// Tenant (company) scope. `None` is only meaningful for superusers.
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_superuser: bool,
}

fn default_active() -> bool {
    true
}

impl Principal {
    /// A regular tenant member with the given permission codenames
    pub fn member<I, S>(tenant_id: Uuid, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: Uuid::new_v4(),
            tenant_id: Some(tenant_id),
            permissions: permissions.into_iter().map(Into::into).collect(),
            is_active: true,
            is_superuser: false,
        }
    }

    /// A superuser, optionally scoped to a tenant for writes
    pub fn superuser(tenant_id: Option<Uuid>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            tenant_id,
            permissions: BTreeSet::new(),
            is_active: true,
            is_superuser: true,
        }
    }

    /// Check `"{model}:{action}"`, `"{model}:*"` or `"*"`
    pub fn has_permission(&self, model: &str, action: Action) -> bool {
        if !self.is_active {
            return false;
        }
        if self.is_superuser {
            return true;
        }
        self.permissions.contains("*")
            || self.permissions.contains(&format!("{}:*", model))
            || self
                .permissions
                .contains(&format!("{}:{}", model, action.as_str()))
    }

    /// Fail with `PermissionDenied` unless the permission is held
    pub fn require(&self, model: &str, action: Action) -> Result<()> {
        if self.has_permission(model, action) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "missing permission {}:{}",
                model,
                action.as_str()
            )))
        }
    }
}

/// Everything an operation knows about its caller
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Principal,
    /// Raw bearer credential, forwarded to remote services
    pub credential: Option<String>,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// Resolves a bearer credential into a principal
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Principal>;
}

/// Authenticator backed by a fixed token table
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, Principal>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Principal> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| Error::Authentication("unknown credential".to_string()))
    }
}
