// src/core/cluster/authority.rs

//! Authority arbitration: deterministically assigns each checkable to exactly
//! one peer per feature.
//!
//! Every peer evaluates `H(name || "\0" || feature) mod |E_Z|` over the same
//! sorted list of connected zone endpoints, so assignments converge within
//! one connectivity round-trip without coordination.

pub const FEATURE_CHECKER: &str = "checker";
pub const FEATURE_NOTIFIER: &str = "notifier";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over `name || "\0" || feature`.
pub fn authority_hash(object_name: &str, feature: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in object_name
        .as_bytes()
        .iter()
        .chain(std::iter::once(&0u8))
        .chain(feature.as_bytes())
    {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Picks the authoritative member for an object. `members` must be the
/// connected endpoints of the owning zone, sorted ascending by name; with no
/// connected member nobody is authoritative.
pub fn authority_for<'a>(
    members: &'a [String],
    object_name: &str,
    feature: &str,
) -> Option<&'a str> {
    if members.is_empty() {
        return None;
    }
    let index = (authority_hash(object_name, feature) % members.len() as u64) as usize;
    Some(members[index].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        // The same inputs must map to the same index on every peer.
        assert_eq!(
            authority_hash("web1", FEATURE_CHECKER),
            authority_hash("web1", FEATURE_CHECKER)
        );
        assert_ne!(
            authority_hash("web1", FEATURE_CHECKER),
            authority_hash("web1", FEATURE_NOTIFIER)
        );
        assert_ne!(
            authority_hash("web1", FEATURE_CHECKER),
            authority_hash("web2", FEATURE_CHECKER)
        );
    }

    #[test]
    fn separator_prevents_boundary_collisions() {
        assert_ne!(
            authority_hash("ab", "cchecker"),
            authority_hash("abc", "checker")
        );
    }

    #[test]
    fn empty_member_list_has_no_authority() {
        assert_eq!(authority_for(&[], "web1", FEATURE_CHECKER), None);
    }

    #[test]
    fn single_member_owns_everything() {
        let members = vec!["node-a".to_string()];
        for name in ["web1", "web2", "db1"] {
            assert_eq!(
                authority_for(&members, name, FEATURE_CHECKER),
                Some("node-a")
            );
        }
    }

    #[test]
    fn assignment_spreads_over_members() {
        let members = vec!["node-a".to_string(), "node-b".to_string()];
        let mut owners = std::collections::HashSet::new();
        for i in 0..100 {
            let name = format!("host{i}");
            owners.insert(
                authority_for(&members, &name, FEATURE_CHECKER)
                    .unwrap()
                    .to_string(),
            );
        }
        assert_eq!(owners.len(), 2);
    }
}
