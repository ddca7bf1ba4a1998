const ACCOUNT_RANK: u16 = 0;
const ROLE_RANK: u16 = 10;
const MEMBERSHIP_RANK: u16 = 20;
const CLASSIFICATION_RANK: u16 = 30;
const WORKFLOW_RANK: u16 = 40;
const DOCUMENT_RANK: u16 = 50;
const VERSION_RANK: u16 = 60;
const AUDIT_RANK: u16 = 90;
const DEFAULT_RANK: u16 = 1000;

pub(crate) fn table_order_key(record_type: &str) -> (u16, &str) {
    let rank = match record_type {
        "accounts" => ACCOUNT_RANK,
        "roles" | "permissions" => ROLE_RANK,
        "memberships" | "role_permissions" => MEMBERSHIP_RANK,
        "document_types" => CLASSIFICATION_RANK,
        "workflow_states" => WORKFLOW_RANK,
        "documents" => DOCUMENT_RANK,
        "document_versions" => VERSION_RANK,
        "audit_records" => AUDIT_RANK,
        _ => DEFAULT_RANK,
    };

    (rank, record_type)
}

/// Dependency order for record types. A non-empty `priority` replaces the
/// built-in ranks: listed types first in list order, the rest after by
/// rank. Ties keep their incoming order.
pub fn order_record_types(mut types: Vec<String>, priority: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    types.retain(|t| seen.insert(t.clone()));
    types.sort_by_key(|t| {
        let configured = priority
            .iter()
            .position(|p| p == t)
            .unwrap_or(priority.len());
        (configured, table_order_key(t).0)
    });
    types
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn built_in_ranks_put_parents_first() {
        let ordered = order_record_types(
            names(&["audit_records", "memberships", "zeta", "accounts", "roles", "alpha"]),
            &[],
        );
        assert_eq!(
            ordered,
            names(&["accounts", "roles", "memberships", "audit_records", "zeta", "alpha"])
        );
    }

    #[test]
    fn configured_priority_wins() {
        let ordered = order_record_types(
            names(&["accounts", "tags", "documents"]),
            &names(&["tags", "documents"]),
        );
        assert_eq!(ordered, names(&["tags", "documents", "accounts"]));
    }

    #[test]
    fn duplicates_are_dropped() {
        let ordered = order_record_types(names(&["roles", "roles"]), &[]);
        assert_eq!(ordered, names(&["roles"]));
    }
}
