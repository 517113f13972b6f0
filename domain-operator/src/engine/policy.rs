use std::collections::BTreeSet;

use weblogic_domain_types::ServerStartPolicy;

use crate::util::Error;

/// Computes the effective start policy for one server: the most
/// specific non-empty override wins, falling back to `IF_NEEDED` if
/// nothing overrides it.
pub fn effective_start_policy(
    server_override: Option<ServerStartPolicy>,
    cluster_policy: Option<ServerStartPolicy>,
    domain_policy: ServerStartPolicy,
) -> ServerStartPolicy {
    server_override
        .or(cluster_policy)
        .unwrap_or(domain_policy)
}

/// Sort key giving "natural numeric" ordering: a name's alphabetic
/// prefix compares first, then any trailing run of digits compares
/// numerically rather than lexically, so `server2` sorts before
/// `server10`.
fn natural_order_key(name: &str) -> (String, u64, String) {
    let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &name[trimmed.len()..];
    let number = digits.parse::<u64>().unwrap_or(0);
    (trimmed.to_string(), number, name.to_string())
}

/// Sorts `(serverName, effectivePolicy)` pairs into the stable order the
/// evaluator walks. Independent of the caller's input ordering, which is
/// what makes the evaluator's output deterministic regardless of the
/// order `managedServers[]` appears in the Domain spec.
pub fn stable_order(
    mut servers: Vec<(String, ServerStartPolicy)>,
) -> Vec<(String, ServerStartPolicy)> {
    servers.sort_by(|a, b| natural_order_key(&a.0).cmp(&natural_order_key(&b.0)));
    servers
}

/// Given servers already in stable order, returns the set of server
/// names that must be running for a cluster targeting `replicas`
/// members: every `ALWAYS` server always starts; `NEVER` never starts;
/// everything else starts only while a running counter stays below
/// `replicas`.
pub fn started_set(servers: &[(String, ServerStartPolicy)], replicas: i32) -> BTreeSet<String> {
    let (always, rest): (Vec<_>, Vec<_>) = servers
        .iter()
        .cloned()
        .partition(|(_, policy)| *policy == ServerStartPolicy::Always);

    let mut running = 0i32;
    let mut started = BTreeSet::new();
    for (name, policy) in always.into_iter().chain(rest.into_iter()) {
        match policy {
            ServerStartPolicy::Always => {
                started.insert(name);
                running += 1;
            }
            ServerStartPolicy::Never => {}
            ServerStartPolicy::IfNeeded | ServerStartPolicy::AdminOnly => {
                if running < replicas {
                    started.insert(name);
                    running += 1;
                }
            }
        }
    }
    started
}

/// Adjusts a declared replica count to preserve the total number of
/// running cluster members across a policy edit: unsetting a server's
/// `ALWAYS` override frees up a slot that `replicas` must now cover, so
/// the target is decremented; promoting a server to `ALWAYS` removes it
/// from the `replicas`-governed pool, so the target is incremented.
pub fn adjust_replica_count(
    replicas: i32,
    policy_unset_from_always: bool,
    promoted_to_always: bool,
) -> i32 {
    let mut r = replicas;
    if policy_unset_from_always {
        r -= 1;
    }
    if promoted_to_always {
        r += 1;
    }
    r.max(0)
}

/// Generates the `i`-th dynamic-cluster server name (1-indexed).
pub fn dynamic_server_name(prefix: &str, index: u32) -> String {
    format!("{prefix}{index}")
}

/// Validates that a dynamic cluster's declared server index falls
/// within `[1, max_dynamic_cluster_size]`.
pub fn validate_dynamic_server_index(index: u32, max_dynamic_cluster_size: u32) -> Result<(), Error> {
    if index < 1 || index > max_dynamic_cluster_size {
        return Err(Error::Validation(format!(
            "dynamic server index {index} is out of range 1..={max_dynamic_cluster_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, policy: ServerStartPolicy) -> (String, ServerStartPolicy) {
        (name.to_string(), policy)
    }

    #[test]
    fn effective_policy_prefers_the_most_specific_override() {
        assert_eq!(
            effective_start_policy(
                Some(ServerStartPolicy::Always),
                Some(ServerStartPolicy::Never),
                ServerStartPolicy::IfNeeded
            ),
            ServerStartPolicy::Always
        );
        assert_eq!(
            effective_start_policy(None, Some(ServerStartPolicy::Never), ServerStartPolicy::Always),
            ServerStartPolicy::Never
        );
        assert_eq!(
            effective_start_policy(None, None, ServerStartPolicy::AdminOnly),
            ServerStartPolicy::AdminOnly
        );
    }

    #[test]
    fn natural_order_sorts_numeric_suffixes_numerically() {
        let servers = vec![
            server("managed-server10", ServerStartPolicy::IfNeeded),
            server("managed-server2", ServerStartPolicy::IfNeeded),
            server("managed-server1", ServerStartPolicy::IfNeeded),
        ];
        let ordered = stable_order(servers);
        let names: Vec<_> = ordered.into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["managed-server1", "managed-server2", "managed-server10"]
        );
    }

    #[test]
    fn replicas_zero_with_all_if_needed_starts_nothing() {
        let servers = stable_order(vec![
            server("s1", ServerStartPolicy::IfNeeded),
            server("s2", ServerStartPolicy::IfNeeded),
        ]);
        assert!(started_set(&servers, 0).is_empty());
    }

    #[test]
    fn two_always_plus_replicas_three_starts_one_additional_server() {
        let servers = stable_order(vec![
            server("s1", ServerStartPolicy::Always),
            server("s2", ServerStartPolicy::Always),
            server("s3", ServerStartPolicy::IfNeeded),
            server("s4", ServerStartPolicy::IfNeeded),
        ]);
        let started = started_set(&servers, 3);
        assert_eq!(
            started,
            BTreeSet::from(["s1".to_string(), "s2".to_string(), "s3".to_string()])
        );
    }

    #[test]
    fn promoting_a_server_to_always_can_displace_a_numerically_earlier_one() {
        // 5-server dynamic cluster, replicas=1, managed-server3 promoted to ALWAYS.
        let servers = stable_order(vec![
            server("managed-server1", ServerStartPolicy::IfNeeded),
            server("managed-server2", ServerStartPolicy::IfNeeded),
            server("managed-server3", ServerStartPolicy::Always),
            server("managed-server4", ServerStartPolicy::IfNeeded),
            server("managed-server5", ServerStartPolicy::IfNeeded),
        ]);
        let started = started_set(&servers, 1);
        assert_eq!(started, BTreeSet::from(["managed-server3".to_string()]));
    }

    #[test]
    fn started_set_is_independent_of_input_ordering() {
        let a = stable_order(vec![
            server("s1", ServerStartPolicy::Always),
            server("s2", ServerStartPolicy::IfNeeded),
            server("s3", ServerStartPolicy::IfNeeded),
        ]);
        let b = stable_order(vec![
            server("s3", ServerStartPolicy::IfNeeded),
            server("s1", ServerStartPolicy::Always),
            server("s2", ServerStartPolicy::IfNeeded),
        ]);
        assert_eq!(started_set(&a, 2), started_set(&b, 2));
    }

    #[test]
    fn never_policy_is_never_started_even_under_high_replicas() {
        let servers = stable_order(vec![
            server("s1", ServerStartPolicy::Never),
            server("s2", ServerStartPolicy::IfNeeded),
        ]);
        let started = started_set(&servers, 5);
        assert!(!started.contains("s1"));
        assert!(started.contains("s2"));
    }

    #[test]
    fn dynamic_cluster_index_out_of_range_fails_validation() {
        assert!(validate_dynamic_server_index(7, 5).is_err());
        assert!(validate_dynamic_server_index(1, 5).is_ok());
        assert!(validate_dynamic_server_index(5, 5).is_ok());
    }

    #[test]
    fn dynamic_server_name_uses_one_based_index() {
        assert_eq!(dynamic_server_name("managed-server", 1), "managed-server1");
    }

    #[test]
    fn adjust_replica_count_keeps_total_running_members_constant() {
        assert_eq!(adjust_replica_count(2, true, false), 1);
        assert_eq!(adjust_replica_count(2, false, true), 3);
        assert_eq!(adjust_replica_count(0, true, false), 0);
    }
}
