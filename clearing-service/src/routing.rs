//! Routing table: recipient handle to institution and account

use crate::{Error, Result};
use chrono::Utc;
use ledger_core::{
    storage::Storage,
    types::{AccountNumber, InstitutionId, RoutingEntry, RoutingHandle},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// New routing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRoute {
    /// Recipient handle
    pub handle: RoutingHandle,
    /// Destination institution
    pub institution: InstitutionId,
    /// Destination account
    pub account_number: AccountNumber,
    /// Recipient display name
    #[serde(default)]
    pub display_name: String,
}

/// Replacement target for an existing handle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUpdate {
    /// Destination institution
    pub institution: InstitutionId,
    /// Destination account
    pub account_number: AccountNumber,
    /// Recipient display name
    #[serde(default)]
    pub display_name: String,
}

/// Routing table over the clearing store
#[derive(Debug, Clone)]
pub struct RoutingTable {
    storage: Arc<Storage>,
}

impl RoutingTable {
    /// Table backed by `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Add a handle. Handles are unique.
    pub fn register(&self, route: NewRoute) -> Result<RoutingEntry> {
        validate(route.handle.as_str(), &route.institution, &route.account_number)?;
        let now = Utc::now();
        let entry = RoutingEntry {
            handle: route.handle,
            institution: route.institution,
            account_number: route.account_number,
            display_name: route.display_name,
            created_at: now,
            updated_at: now,
        };

        let inserted = self.storage.transaction(|txn| {
            if txn.routing_entry(&entry.handle)?.is_some() {
                return Ok(false);
            }
            txn.put_routing_entry(&entry)?;
            Ok(true)
        })?;
        if !inserted {
            return Err(Error::DuplicateHandle(entry.handle.to_string()));
        }

        info!(
            handle = %entry.handle,
            institution = %entry.institution,
            "Routing entry registered"
        );
        Ok(entry)
    }

    /// Look up a handle
    pub fn resolve(&self, handle: &RoutingHandle) -> Result<Option<RoutingEntry>> {
        Ok(self.storage.routing_entry(handle)?)
    }

    /// Repoint a handle. `None` if it is not mapped.
    pub fn update(&self, handle: &RoutingHandle, update: RouteUpdate) -> Result<Option<RoutingEntry>> {
        validate(handle.as_str(), &update.institution, &update.account_number)?;

        let updated = self.storage.transaction(|txn| {
            let Some(mut entry) = txn.routing_entry(handle)? else {
                return Ok(None);
            };
            entry.institution = update.institution.clone();
            entry.account_number = update.account_number.clone();
            entry.display_name = update.display_name.clone();
            entry.updated_at = Utc::now();
            txn.put_routing_entry(&entry)?;
            Ok(Some(entry))
        })?;

        if let Some(entry) = &updated {
            info!(handle = %handle, institution = %entry.institution, "Routing entry updated");
        }
        Ok(updated)
    }

    /// Drop a handle. `false` if it was not mapped.
    pub fn remove(&self, handle: &RoutingHandle) -> Result<bool> {
        let removed = self.storage.transaction(|txn| {
            if txn.routing_entry(handle)?.is_none() {
                return Ok(false);
            }
            txn.delete_routing_entry(handle);
            Ok(true)
        })?;
        if removed {
            info!(handle = %handle, "Routing entry removed");
        }
        Ok(removed)
    }

    /// All entries, ordered by handle
    pub fn list(&self) -> Result<Vec<RoutingEntry>> {
        Ok(self.storage.routing_entries()?)
    }
}

fn validate(handle: &str, institution: &InstitutionId, account: &AccountNumber) -> Result<()> {
    if handle.trim().is_empty() {
        return Err(Error::Validation("handle must not be empty".to_string()));
    }
    if institution.as_str().trim().is_empty() {
        return Err(Error::Validation("institution must not be empty".to_string()));
    }
    if account.as_str().trim().is_empty() {
        return Err(Error::Validation("account number must not be empty".to_string()));
    }
    Ok(())
}
