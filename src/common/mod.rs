// # Common Types
//
// Shared identifiers and site/variable topology constants used across the
// store, lock manager, site, and transaction manager modules.

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for a transaction. Assigned by the client, not by us —
/// `begin`/`beginRO` reject a txid that is already open.
pub type TransactionId = u64;

/// Site index, 1..=10.
pub type SiteId = u32;

/// Variable index, 1..=20.
pub type VariableId = u32;

/// Logical clock advanced by one on every `send_commands` batch.
pub type Tick = u64;

// ============================================================================
// Site / variable topology
// ============================================================================

/// Number of sites in the configuration.
pub const NUM_SITES: u32 = 10;

/// Number of variables in the configuration.
pub const NUM_VARIABLES: u32 = 20;

/// True if `variable` is replicated at every site.
#[inline]
pub fn is_even(variable: VariableId) -> bool {
    variable % 2 == 0
}

/// The single site that owns an odd variable: `1 + (x mod 10)`.
#[inline]
pub fn owning_site(variable: VariableId) -> SiteId {
    1 + (variable % 10)
}

/// The default value a variable holds in a freshly initialized data
/// directory: `10 * variable`.
#[inline]
pub fn default_value(variable: VariableId) -> i64 {
    10 * variable as i64
}

/// The sites at which `variable` is hosted in the default 10-site/20-variable
/// configuration: all sites if even, the single owning site if odd.
pub fn hosting_sites(variable: VariableId) -> Vec<SiteId> {
    if is_even(variable) {
        (1..=NUM_SITES).collect()
    } else {
        vec![owning_site(variable)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_variables_are_replicated_everywhere() {
        assert!(is_even(2));
        assert!(!is_even(1));
        assert_eq!(hosting_sites(4).len(), NUM_SITES as usize);
    }

    #[test]
    fn odd_variable_owner_matches_mod_rule() {
        assert_eq!(owning_site(1), 1 + (1 % 10));
        assert_eq!(owning_site(11), 1 + (11 % 10));
        assert_eq!(hosting_sites(7), vec![owning_site(7)]);
    }

    #[test]
    fn default_values_follow_ten_x_rule() {
        assert_eq!(default_value(1), 10);
        assert_eq!(default_value(20), 200);
    }
}
