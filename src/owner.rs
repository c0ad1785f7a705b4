//! Owners (characters and corporations) and the directory that lists them.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::warn;

use crate::config::OwnerConfig;

/// Kind of authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
  Character,
  Corporation,
}

impl OwnerKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Character => "character",
      Self::Corporation => "corporation",
    }
  }
}

impl fmt::Display for OwnerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OwnerKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "character" | "char" => Ok(Self::Character),
      "corporation" | "corp" => Ok(Self::Corporation),
      other => Err(eyre!("Unknown owner kind '{}'", other)),
    }
  }
}

/// Key identifying an owner across every store: `"<kind>-<id>"`.
pub fn owner_key(kind: OwnerKind, id: i64) -> String {
  format!("{}-{}", kind, id)
}

/// The identity part of an owner, persisted next to the data it produced.
///
/// `character_id` is the character whose token authenticates requests made on
/// behalf of this owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOwner {
  pub kind: OwnerKind,
  pub id: i64,
  pub character_id: i64,
}

impl SourceOwner {
  pub fn key(&self) -> String {
    owner_key(self.kind, self.id)
  }
}

/// An authenticated principal on whose behalf data is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
  pub kind: OwnerKind,
  pub id: i64,
  pub character_id: i64,
  pub name: String,
  pub scopes: Vec<String>,
  /// Set when the remote API rejected this owner's credentials.
  pub auth_failed: bool,
}

impl Owner {
  pub fn character(id: i64, name: impl Into<String>) -> Self {
    Self {
      kind: OwnerKind::Character,
      id,
      character_id: id,
      name: name.into(),
      scopes: Vec::new(),
      auth_failed: false,
    }
  }

  pub fn corporation(id: i64, director_id: i64, name: impl Into<String>) -> Self {
    Self {
      kind: OwnerKind::Corporation,
      id,
      character_id: director_id,
      name: name.into(),
      scopes: Vec::new(),
      auth_failed: false,
    }
  }

  pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.scopes = scopes.into_iter().map(Into::into).collect();
    self
  }

  pub fn key(&self) -> String {
    owner_key(self.kind, self.id)
  }

  pub fn source(&self) -> SourceOwner {
    SourceOwner {
      kind: self.kind,
      id: self.id,
      character_id: self.character_id,
    }
  }

  pub fn has_scope(&self, scope: &str) -> bool {
    self.scopes.iter().any(|s| s == scope)
  }
}

/// Read-only source of truth for "who needs data".
///
/// Token material stays inside the directory; callers only ever get a bearer
/// token handed to them for a single request.
pub trait OwnerDirectory: Send + Sync {
  /// Current owners, in a stable order.
  fn list_owners(&self) -> Vec<Owner>;

  /// Bearer token used for requests on behalf of `owner`.
  fn access_token(&self, owner: &Owner) -> Result<String>;

  /// Flag an owner whose credentials were rejected.
  fn mark_auth_failed(&self, owner_key: &str);

  fn find(&self, owner_key: &str) -> Option<Owner> {
    self.list_owners().into_iter().find(|o| o.key() == owner_key)
  }
}

/// Owner directory backed by the `owners` config section.
///
/// Each owner names an environment variable holding its access token.
pub struct StaticDirectory {
  owners: Vec<(Owner, String)>,
  failed: RwLock<HashSet<String>>,
}

impl StaticDirectory {
  pub fn from_config(owners: &[OwnerConfig]) -> Self {
    let owners = owners
      .iter()
      .map(|c| {
        let name = c.name.clone().unwrap_or_else(|| owner_key(c.kind, c.id));
        let owner = match c.kind {
          OwnerKind::Character => Owner::character(c.id, name),
          OwnerKind::Corporation => {
            Owner::corporation(c.id, c.character_id.unwrap_or(c.id), name)
          }
        }
        .with_scopes(c.scopes.iter().cloned());
        (owner, c.token_env.clone())
      })
      .collect();

    Self {
      owners,
      failed: RwLock::new(HashSet::new()),
    }
  }

  fn is_failed(&self, key: &str) -> bool {
    self
      .failed
      .read()
      .map(|f| f.contains(key))
      .unwrap_or(false)
  }
}

impl OwnerDirectory for StaticDirectory {
  fn list_owners(&self) -> Vec<Owner> {
    self
      .owners
      .iter()
      .map(|(owner, token_env)| {
        let mut owner = owner.clone();
        owner.auth_failed = self.is_failed(&owner.key()) || std::env::var_os(token_env).is_none();
        owner
      })
      .collect()
  }

  fn access_token(&self, owner: &Owner) -> Result<String> {
    let (_, token_env) = self
      .owners
      .iter()
      .find(|(o, _)| o.kind == owner.kind && o.id == owner.id)
      .ok_or_else(|| eyre!("Unknown owner {}", owner.key()))?;

    std::env::var(token_env)
      .map_err(|_| eyre!("Access token for {} not found. Set {}.", owner.key(), token_env))
  }

  fn mark_auth_failed(&self, owner_key: &str) {
    match self.failed.write() {
      Ok(mut failed) => {
        if failed.insert(owner_key.to_string()) {
          warn!(owner = %owner_key, "Credentials rejected, owner will be skipped");
        }
      }
      Err(e) => warn!(error = %e, "Owner directory lock poisoned"),
    }
  }
}
