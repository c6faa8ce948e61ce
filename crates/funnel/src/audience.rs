//! Audience groups and their membership rosters.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use funnel_core::error::{FunnelError, FunnelResult};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{AudienceGroup, Membership};

/// Result of adding a customer to a group.
#[derive(Debug, Clone)]
pub enum MembershipChange {
    /// The customer was not in the group before.
    Entered(Membership),
    /// The customer was already in the group; `entered_at` moved to the new
    /// entry instant.
    Reentered {
        previous_entered_at: DateTime<Utc>,
        membership: Membership,
    },
}

impl MembershipChange {
    pub fn membership(&self) -> &Membership {
        match self {
            MembershipChange::Entered(m) => m,
            MembershipChange::Reentered { membership, .. } => membership,
        }
    }

    pub fn is_reentry(&self) -> bool {
        matches!(self, MembershipChange::Reentered { .. })
    }
}

#[derive(Default)]
pub struct AudienceRegistry {
    groups: DashMap<Uuid, AudienceGroup>,
    /// Keyed by (group, customer): at most one membership per pair.
    memberships: DashMap<(Uuid, String), Membership>,
}

impl AudienceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_group(&self, group: AudienceGroup) -> FunnelResult<Uuid> {
        if group.name.trim().is_empty() {
            return Err(FunnelError::validation("group name must not be empty"));
        }
        let id = group.id;
        info!(group_id = %id, name = %group.name, "Creating audience group");
        self.groups.insert(id, group);
        Ok(id)
    }

    pub fn get_group(&self, id: &Uuid) -> Option<AudienceGroup> {
        self.groups.get(id).map(|g| g.clone())
    }

    pub fn list_groups(&self, partner_id: &str) -> Vec<AudienceGroup> {
        self.groups
            .iter()
            .filter(|g| g.partner_id == partner_id)
            .map(|g| g.value().clone())
            .collect()
    }

    /// Delete a group and its roster. Returns the removed memberships.
    pub fn delete_group(&self, id: &Uuid) -> FunnelResult<Vec<Membership>> {
        self.groups
            .remove(id)
            .ok_or_else(|| FunnelError::not_found(format!("group {}", id)))?;
        let keys: Vec<(Uuid, String)> = self
            .memberships
            .iter()
            .filter(|m| m.key().0 == *id)
            .map(|m| m.key().clone())
            .collect();
        let removed: Vec<Membership> = keys
            .into_iter()
            .filter_map(|k| self.memberships.remove(&k).map(|(_, m)| m))
            .collect();
        info!(group_id = %id, members = removed.len(), "Deleted audience group");
        Ok(removed)
    }

    /// Record an entry event. Re-adding an existing member is a re-entry,
    /// never a second membership.
    pub fn enter(
        &self,
        group_id: &Uuid,
        customer_id: &str,
        at: DateTime<Utc>,
    ) -> FunnelResult<MembershipChange> {
        if !self.groups.contains_key(group_id) {
            return Err(FunnelError::not_found(format!("group {}", group_id)));
        }
        if customer_id.trim().is_empty() {
            return Err(FunnelError::validation("customer id must not be empty"));
        }

        let change = match self.memberships.entry((*group_id, customer_id.to_string())) {
            Entry::Occupied(mut occupied) => {
                let membership = occupied.get_mut();
                let previous_entered_at = membership.entered_at;
                membership.entered_at = at;
                MembershipChange::Reentered {
                    previous_entered_at,
                    membership: membership.clone(),
                }
            }
            Entry::Vacant(vacant) => {
                let membership = Membership {
                    group_id: *group_id,
                    customer_id: customer_id.to_string(),
                    entered_at: at,
                };
                vacant.insert(membership.clone());
                MembershipChange::Entered(membership)
            }
        };
        debug!(
            group_id = %group_id,
            customer_id = %customer_id,
            reentry = change.is_reentry(),
            "Membership recorded"
        );
        Ok(change)
    }

    pub fn remove(&self, group_id: &Uuid, customer_id: &str) -> FunnelResult<Membership> {
        self.memberships
            .remove(&(*group_id, customer_id.to_string()))
            .map(|(_, m)| m)
            .ok_or_else(|| {
                FunnelError::not_found(format!("customer {} in group {}", customer_id, group_id))
            })
    }

    pub fn membership(&self, group_id: &Uuid, customer_id: &str) -> Option<Membership> {
        self.memberships
            .get(&(*group_id, customer_id.to_string()))
            .map(|m| m.clone())
    }

    pub fn members(&self, group_id: &Uuid) -> Vec<Membership> {
        self.memberships
            .iter()
            .filter(|m| m.key().0 == *group_id)
            .map(|m| m.value().clone())
            .collect()
    }

    /// Whether the customer still belongs to any group of the partner.
    pub fn is_partner_member(&self, partner_id: &str, customer_id: &str) -> bool {
        self.memberships.iter().any(|m| {
            m.customer_id == customer_id
                && self
                    .groups
                    .get(&m.group_id)
                    .map(|g| g.partner_id == partner_id)
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reentry_updates_single_membership() {
        let registry = AudienceRegistry::new();
        let group = registry
            .create_group(AudienceGroup::new("p-1", "Jeju 3박4일"))
            .unwrap();
        let t0 = Utc::now();

        let first = registry.enter(&group, "cust-1", t0).unwrap();
        assert!(!first.is_reentry());

        let t1 = t0 + Duration::days(10);
        match registry.enter(&group, "cust-1", t1).unwrap() {
            MembershipChange::Reentered {
                previous_entered_at,
                membership,
            } => {
                assert_eq!(previous_entered_at, t0);
                assert_eq!(membership.entered_at, t1);
            }
            other => panic!("expected re-entry, got {:?}", other),
        }
        assert_eq!(registry.members(&group).len(), 1);
    }

    #[test]
    fn test_enter_unknown_group_fails() {
        let registry = AudienceRegistry::new();
        assert!(matches!(
            registry.enter(&Uuid::new_v4(), "cust-1", Utc::now()),
            Err(FunnelError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_then_partner_membership() {
        let registry = AudienceRegistry::new();
        let a = registry.create_group(AudienceGroup::new("p-1", "A")).unwrap();
        let b = registry.create_group(AudienceGroup::new("p-1", "B")).unwrap();
        registry.enter(&a, "cust-1", Utc::now()).unwrap();
        registry.enter(&b, "cust-1", Utc::now()).unwrap();

        registry.remove(&a, "cust-1").unwrap();
        assert!(registry.is_partner_member("p-1", "cust-1"));
        registry.remove(&b, "cust-1").unwrap();
        assert!(!registry.is_partner_member("p-1", "cust-1"));
        assert!(registry.remove(&b, "cust-1").is_err());
    }

    #[test]
    fn test_delete_group_drops_roster() {
        let registry = AudienceRegistry::new();
        let group = registry.create_group(AudienceGroup::new("p-1", "A")).unwrap();
        registry.enter(&group, "c-1", Utc::now()).unwrap();
        registry.enter(&group, "c-2", Utc::now()).unwrap();

        let removed = registry.delete_group(&group).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(registry.members(&group).is_empty());
    }
}
