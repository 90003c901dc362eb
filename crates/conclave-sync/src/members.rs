//! Membership listing.

use conclave_kv::CoordinationStore;
use tracing::warn;

use crate::election::leader_entry;
use crate::error::SyncError;
use crate::keys::members_prefix;
use crate::types::Member;
use crate::types::Role;

/// Every registered member of `namespace`, sorted by id.
///
/// Roles come from election order rather than the stored record: the member
/// with the earliest registration is [`Role::Primary`], everyone else a
/// follower. Records that fail to decode are skipped.
pub(crate) async fn list_members<S>(store: &S, prefix: &str, namespace: &str) -> Result<Vec<Member>, SyncError>
where
    S: CoordinationStore + ?Sized,
{
    let range = store.get_prefix(&members_prefix(prefix, namespace)).await?;
    let leader_key = leader_entry(&range.entries).map(|kv| kv.key.clone());

    let mut members: Vec<Member> = range
        .entries
        .iter()
        .filter_map(|kv| match Member::decode(&kv.key, &kv.value) {
            Ok(member) => {
                let role = if leader_key.as_deref() == Some(kv.key.as_str()) {
                    Role::Primary
                } else {
                    Role::Follower
                };
                Some(member.with_role(role))
            }
            Err(err) => {
                warn!(key = %kv.key, error = %err, "skipping undecodable member record");
                None
            }
        })
        .collect();
    members.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(members)
}
