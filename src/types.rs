//! Core types for the entity store.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Discriminator tag for entity kinds sharing the flat keyspace.
///
/// Stored as out-of-band metadata alongside the serialized value; the
/// engine itself enforces no schema, so every read path re-checks this
/// tag before trusting the deserialized payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    User,
    Account,
}

impl Kind {
    /// The on-disk tag byte for this kind.
    pub fn tag(self) -> u8 {
        match self {
            Kind::User => 1,
            Kind::Account => 2,
        }
    }

    /// Parse a tag byte back into a kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Kind::User),
            2 => Some(Kind::Account),
            _ => None,
        }
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::User => write!(f, "User"),
            Kind::Account => write!(f, "Account"),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Seconds since Unix epoch.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_secs() as i64)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Reference into the external billing provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BillingRef {
    /// Opaque customer id assigned by the provider.
    pub customer_id: String,

    /// Opaque payment source id, if one has been attached.
    #[serde(default)]
    pub source: Option<String>,
}

/// A plan subscription held by an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRef {
    pub plan: String,
    pub subscription_id: String,
    #[serde(default)]
    pub usage_item: Option<String>,
}

/// A user entity, keyed by email address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct User {
    pub email: String,
    pub name: String,

    /// Free-form caller-owned metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub billing: Option<BillingRef>,

    /// Names of accounts this user belongs to.
    #[serde(default)]
    pub accounts: Vec<String>,

    /// Assigned by the store on write when zero; never decreases.
    #[serde(default)]
    pub updated_at: Timestamp,

    /// Optional absolute expiry; zero means never.
    #[serde(default)]
    pub expires_at: Timestamp,
}

/// An organizational account entity, keyed by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct Account {
    pub name: String,
    pub admin_email: String,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub billing: Option<BillingRef>,

    #[serde(default)]
    pub plans: Vec<PlanRef>,

    #[serde(default)]
    pub updated_at: Timestamp,

    #[serde(default)]
    pub expires_at: Timestamp,
}

/// Typed access contract the store is parameterized over.
///
/// The key is globally unique across all kinds; the store does not
/// namespace keys by kind.
pub trait EntityRecord:
    Clone + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Discriminator for this record type.
    const KIND: Kind;

    /// Unique key within the flat keyspace.
    fn key(&self) -> &str;

    /// Structural validation: required fields must be non-empty.
    fn validate(&self) -> Result<()>;

    fn updated_at(&self) -> Timestamp;
    fn set_updated_at(&mut self, at: Timestamp);
    fn expires_at(&self) -> Timestamp;

    /// Wrap into the tagged union carried by codec and hub events.
    fn into_entity(self) -> Entity;

    /// Unwrap from the tagged union; `None` on kind mismatch.
    fn from_entity(entity: Entity) -> Option<Self>;
}

impl EntityRecord for User {
    const KIND: Kind = Kind::User;

    fn key(&self) -> &str {
        &self.email
    }

    fn validate(&self) -> Result<()> {
        if self.email.is_empty() {
            return Err(StoreError::Validation("user email is required".into()));
        }
        if self.name.is_empty() {
            return Err(StoreError::Validation("user name is required".into()));
        }
        Ok(())
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    fn into_entity(self) -> Entity {
        Entity::User(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::User(u) => Some(u),
            _ => None,
        }
    }
}

impl EntityRecord for Account {
    const KIND: Kind = Kind::Account;

    fn key(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StoreError::Validation("account name is required".into()));
        }
        if self.admin_email.is_empty() {
            return Err(StoreError::Validation(
                "account admin email is required".into(),
            ));
        }
        Ok(())
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: Timestamp) {
        self.updated_at = at;
    }

    fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    fn into_entity(self) -> Entity {
        Entity::Account(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Account(a) => Some(a),
            _ => None,
        }
    }
}

/// Tagged union over all entity kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    User(User),
    Account(Account),
}

impl Entity {
    pub fn kind(&self) -> Kind {
        match self {
            Entity::User(_) => Kind::User,
            Entity::Account(_) => Kind::Account,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Entity::User(u) => &u.email,
            Entity::Account(a) => &a.name,
        }
    }

    pub fn updated_at(&self) -> Timestamp {
        match self {
            Entity::User(u) => u.updated_at,
            Entity::Account(a) => a.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tag_roundtrip() {
        assert_eq!(Kind::from_tag(Kind::User.tag()), Some(Kind::User));
        assert_eq!(Kind::from_tag(Kind::Account.tag()), Some(Kind::Account));
        assert_eq!(Kind::from_tag(0), None);
        assert_eq!(Kind::from_tag(99), None);
    }

    #[test]
    fn test_user_validation() {
        let user = User {
            email: "alice@example.com".into(),
            name: "Alice".into(),
            ..Default::default()
        };
        assert!(user.validate().is_ok());

        let missing_name = User {
            email: "alice@example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            missing_name.validate(),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_account_validation() {
        let account = Account {
            name: "acme".into(),
            admin_email: "admin@acme.com".into(),
            ..Default::default()
        };
        assert!(account.validate().is_ok());

        let missing_admin = Account {
            name: "acme".into(),
            ..Default::default()
        };
        assert!(missing_admin.validate().is_err());
    }

    #[test]
    fn test_entity_key_and_kind() {
        let entity = User {
            email: "bob@example.com".into(),
            name: "Bob".into(),
            ..Default::default()
        }
        .into_entity();

        assert_eq!(entity.kind(), Kind::User);
        assert_eq!(entity.key(), "bob@example.com");
        assert!(Account::from_entity(entity).is_none());
    }
}
