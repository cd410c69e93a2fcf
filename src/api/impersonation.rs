//! One-shot probe for the act-on-behalf-of-another-user privilege.

use log::debug;
use serde_json::Value;

use crate::api::models::ConnectionProfile;
use crate::api::session::Session;

/// Privilege that allows a caller to act on behalf of another user.
const DELEGATION_PRIVILEGE: &str = "prvActOnBehalfOfAnotherUser";

/// Depth bit granting the privilege organization-wide.
const GLOBAL_DEPTH_BIT: i64 = 8;

/// Determines once per session whether the authenticated principal may
/// impersonate other users.
pub struct ImpersonationProbe;

impl ImpersonationProbe {
    /// Computes and caches the capability for the profile's current session.
    /// Already-cached results are left untouched until the session is replaced.
    pub async fn ensure(profile: &ConnectionProfile, session: &dyn Session) {
        if profile.impersonation_cached() {
            return;
        }
        profile.cache_impersonation(Self::probe(session).await);
    }

    /// True when the caller's roles grant the delegation privilege at global
    /// depth. This is a capability check, not a critical-path operation: any
    /// failure counts as "capability absent".
    pub async fn probe(session: &dyn Session) -> bool {
        match session.fetch(&probe_query()).await {
            Ok(rows) => rows.iter().any(has_global_depth),
            Err(fault) => {
                debug!("impersonation capability probe failed: {fault}");
                false
            }
        }
    }
}

fn has_global_depth(row: &Value) -> bool {
    row.get("priv.privilegedepthmask")
        .and_then(Value::as_i64)
        .is_some_and(|mask| mask & GLOBAL_DEPTH_BIT != 0)
}

/// Role/privilege relationship query for the current caller, filtered to the
/// delegation privilege.
fn probe_query() -> String {
    format!(
        r#"<fetch version="1.0" output-format="xml-platform" mapping="logical" distinct="true">
  <entity name="systemuserroles">
    <filter>
      <condition attribute="systemuserid" operator="eq-userid" />
    </filter>
    <link-entity name="role" from="roleid" to="roleid">
      <link-entity name="roleprivileges" from="roleid" to="roleid" alias="priv">
        <attribute name="privilegedepthmask" />
        <link-entity name="privilege" from="privilegeid" to="privilegeid">
          <filter>
            <condition attribute="name" operator="eq" value="{DELEGATION_PRIVILEGE}" />
          </filter>
        </link-entity>
      </link-entity>
    </link-entity>
  </entity>
</fetch>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_targets_the_delegation_privilege() {
        let query = probe_query();
        assert!(query.contains(DELEGATION_PRIVILEGE));
        assert!(query.contains("eq-userid"));
        assert!(query.contains("privilegedepthmask"));
    }

    #[test]
    fn depth_mask_requires_the_global_bit() {
        let global = serde_json::json!({"priv.privilegedepthmask": 8});
        let local = serde_json::json!({"priv.privilegedepthmask": 1});
        let missing = serde_json::json!({"other": true});

        assert!(has_global_depth(&global));
        assert!(!has_global_depth(&local));
        assert!(!has_global_depth(&missing));
    }
}
