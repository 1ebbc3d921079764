//! Caller-side workflows around the store.
//!
//! The billing/identity provider is a side-effecting dependency the
//! store itself never calls; these workflows read-modify-write entities
//! around it using the store's primitive operations.

use crate::error::{Result, StoreError};
use crate::store::EntityStore;
use crate::types::{Account, BillingRef, PlanRef, User};
use std::collections::BTreeMap;

/// Ids minted by the provider for a new plan subscription. The usage
/// item is present only for metered plans.
#[derive(Clone, Debug)]
pub struct SubscriptionRef {
    pub subscription_id: String,
    pub usage_item: Option<String>,
}

/// External billing provider. Opaque ids in, opaque ids out; failures
/// surface as `Provider` errors and abort the workflow before any store
/// write.
pub trait BillingProvider: Send + Sync {
    /// Provision a customer; returns its id.
    fn create_customer(&self, email: &str, name: &str) -> Result<String>;

    /// Attach a payment source to a customer.
    fn attach_source(&self, customer_id: &str, source: &str) -> Result<()>;

    /// Subscribe a customer to a plan.
    fn create_subscription(&self, customer_id: &str, plan: &str) -> Result<SubscriptionRef>;

    /// Report metered usage against a subscription item.
    fn record_usage(&self, usage_item: &str, quantity: i64) -> Result<()>;

    /// Charge a customer; returns the charge id.
    fn charge(
        &self,
        customer_id: &str,
        amount: i64,
        description: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<String>;
}

/// Identity asserted by an external identity exchange (e.g. a verified
/// third-party login).
#[derive(Clone, Debug)]
pub struct IdentityProfile {
    pub email: String,
    pub name: String,
}

/// Upsert-on-first-login. An existing user is returned as-is; a first
/// login provisions a billing customer and creates the user. Returns the
/// user and whether it was created.
pub fn login(
    store: &EntityStore,
    billing: &dyn BillingProvider,
    profile: &IdentityProfile,
) -> Result<(User, bool)> {
    match store.get_one::<User>(&profile.email) {
        Ok(user) => return Ok((user, false)),
        Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let customer_id = billing.create_customer(&profile.email, &profile.name)?;
    let user = User {
        email: profile.email.clone(),
        name: profile.name.clone(),
        billing: Some(BillingRef {
            customer_id,
            source: None,
        }),
        ..Default::default()
    };

    // A racing login may have committed first; get_or_create resolves the
    // race in its favor and this provisioned customer goes unused.
    store.get_or_create(&profile.email, || user)
}

/// Create a new account with a provisioned billing customer. Fails if an
/// account with this name already exists.
pub fn create_account(
    store: &EntityStore,
    billing: &dyn BillingProvider,
    name: &str,
    admin_email: &str,
    metadata: BTreeMap<String, String>,
) -> Result<Account> {
    if store.get_one::<Account>(name).is_ok() {
        return Err(StoreError::InvalidArgument(format!(
            "account {} already exists",
            name
        )));
    }

    let customer_id = billing.create_customer(admin_email, name)?;
    store.put(Account {
        name: name.to_string(),
        admin_email: admin_email.to_string(),
        metadata,
        billing: Some(BillingRef {
            customer_id,
            source: None,
        }),
        ..Default::default()
    })
}

/// Add the user to an account's membership list. Both sides must exist
/// under their expected kinds.
pub fn link_user_account(
    store: &EntityStore,
    user_email: &str,
    account_name: &str,
) -> Result<User> {
    let mut user = store.get_one::<User>(user_email)?;
    // Verifies the account side's tag as well.
    store.get_one::<Account>(account_name)?;

    if !user.accounts.iter().any(|a| a == account_name) {
        user.accounts.push(account_name.to_string());
        user = store.put(user)?;
    }
    Ok(user)
}

/// Subscribe an account to a plan and record the subscription.
pub fn add_account_plan(
    store: &EntityStore,
    billing: &dyn BillingProvider,
    account_name: &str,
    plan: &str,
) -> Result<Account> {
    let mut account = store.get_one::<Account>(account_name)?;
    let customer_id = billing_customer(&account)?;

    if account.plans.iter().any(|p| p.plan == plan) {
        return Ok(account);
    }

    let subscription = billing.create_subscription(&customer_id, plan)?;
    account.plans.push(PlanRef {
        plan: plan.to_string(),
        subscription_id: subscription.subscription_id,
        usage_item: subscription.usage_item,
    });
    store.put(account)
}

/// Report metered usage against one of the account's plans. Requires an
/// attached payment source and a metered subscription to that plan.
pub fn inc_account_plan_usage(
    store: &EntityStore,
    billing: &dyn BillingProvider,
    account_name: &str,
    plan: &str,
    increment: i64,
) -> Result<()> {
    let account = store.get_one::<Account>(account_name)?;

    let has_source = account
        .billing
        .as_ref()
        .is_some_and(|b| b.source.is_some());
    if !has_source {
        return Err(StoreError::InvalidArgument(format!(
            "account {} does not have a payment source",
            account_name
        )));
    }

    let usage_item = account
        .plans
        .iter()
        .find(|p| p.plan == plan)
        .and_then(|p| p.usage_item.as_deref())
        .ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "account {} does not have a metered plan {}",
                account_name, plan
            ))
        })?;

    billing.record_usage(usage_item, increment)
}

/// Attach a payment source to an account's billing customer.
pub fn set_account_source(
    store: &EntityStore,
    billing: &dyn BillingProvider,
    account_name: &str,
    source: &str,
) -> Result<Account> {
    let mut account = store.get_one::<Account>(account_name)?;
    let customer_id = billing_customer(&account)?;

    billing.attach_source(&customer_id, source)?;
    if let Some(ref mut billing_ref) = account.billing {
        billing_ref.source = Some(source.to_string());
    }
    store.put(account)
}

/// Charge an account's billing customer. Returns the charge id.
pub fn charge_account(
    store: &EntityStore,
    billing: &dyn BillingProvider,
    account_name: &str,
    amount: i64,
    description: &str,
    metadata: &BTreeMap<String, String>,
) -> Result<String> {
    let account = store.get_one::<Account>(account_name)?;
    let customer_id = billing_customer(&account)?;
    billing.charge(&customer_id, amount, description, metadata)
}

fn billing_customer(account: &Account) -> Result<String> {
    account
        .billing
        .as_ref()
        .map(|b| b.customer_id.clone())
        .ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "account {} has no billing customer",
                account.name
            ))
        })
}
