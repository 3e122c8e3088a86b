use polsync_core::api::{KindSpec, ProfileSpec};
use polsync_core::model::{KeyFamily, KvPair, KvUpdates, LowLevelKey, LowLevelValue, ProfileRules};
use polsync_core::{Kind, Resource, Result};
use smallvec::smallvec;
use tracing::warn;

use super::rules::convert_rules;
use crate::processor::{check_key, typed_spec, ResourceUpdate, UpdateProcessor};

/// `Profile(name)` -> labels key + rules key.
pub struct ProfileProcessor {
    kind: Kind,
}

impl Default for ProfileProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileProcessor {
    pub fn new() -> Self {
        Self { kind: ProfileSpec::KIND }
    }
}

const FAMILIES: [KeyFamily; 2] = [KeyFamily::ProfileLabels, KeyFamily::ProfileRules];

fn convert(res: &Resource<ProfileSpec>) -> std::result::Result<(LowLevelValue, LowLevelValue), String> {
    let rules = ProfileRules {
        inbound_rules: convert_rules(&res.spec.ingress_rules).map_err(|e| format!("ingress {e}"))?,
        outbound_rules: convert_rules(&res.spec.egress_rules).map_err(|e| format!("egress {e}"))?,
    };
    Ok((LowLevelValue::Labels(res.spec.labels_to_apply.clone()), LowLevelValue::Rules(rules)))
}

impl UpdateProcessor for ProfileProcessor {
    fn kind(&self) -> &Kind {
        &self.kind
    }

    fn families(&self) -> &[KeyFamily] {
        &FAMILIES
    }

    fn process(&mut self, update: &ResourceUpdate) -> Result<KvUpdates> {
        check_key(&self.kind, update)?;
        let profile = update.key.name.clone();
        let labels_key = LowLevelKey::ProfileLabels { profile: profile.clone() };
        let rules_key = LowLevelKey::ProfileRules { profile };

        let converted = typed_spec::<ProfileSpec>(update).and_then(|r| match convert(&r) {
            Ok(v) => Some(v),
            Err(reason) => {
                warn!(key = %update.key, reason = %reason, "unable to convert profile; treating as deleted");
                None
            }
        });
        Ok(match converted {
            Some((labels, rules)) => smallvec![
                KvPair::put(labels_key, labels, update.revision.clone()),
                KvPair::put(rules_key, rules, update.revision.clone()),
            ],
            None => smallvec![KvPair::deletion(labels_key), KvPair::deletion(rules_key)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polsync_core::api::{Action, RuleSpec};
    use polsync_core::{Error, ResourceKey, Revision};

    fn profile(spec: ProfileSpec) -> ResourceUpdate {
        let mut r = Resource::new(Kind::PROFILE, "default", serde_json::to_value(spec).unwrap());
        r.metadata.resource_version = Some(Revision::from("7"));
        ResourceUpdate::upsert(r)
    }

    #[test]
    fn present_profile_yields_labels_and_rules() {
        let mut spec = ProfileSpec::default();
        spec.labels_to_apply.insert("team".into(), "net".into());
        spec.ingress_rules = vec![RuleSpec::new(Action::Allow), RuleSpec::new(Action::Deny)];
        spec.egress_rules = vec![RuleSpec::new(Action::Log)];

        let out = ProfileProcessor::new().process(&profile(spec)).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key, LowLevelKey::ProfileLabels { profile: "default".into() });
        assert_eq!(out[0].revision, Some(Revision::from("7")));
        let Some(LowLevelValue::Rules(rules)) = &out[1].value else { panic!("rules expected: {:?}", out[1]) };
        let inbound: Vec<_> = rules.inbound_rules.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(inbound, vec!["allow", "deny"]);
        assert_eq!(rules.outbound_rules.len(), 1);
    }

    #[test]
    fn deletion_clears_every_owned_key() {
        let update = ResourceUpdate::deletion(ResourceKey::new(Kind::PROFILE, "default"), Some(Revision::from("9")));
        let out = ProfileProcessor::new().process(&update).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(KvPair::is_deletion));
        assert!(out.iter().all(|kv| kv.revision.is_none()));
    }

    #[test]
    fn bad_cidr_is_treated_as_deletion() {
        let mut rule = RuleSpec::new(Action::Allow);
        rule.source.nets = vec!["10.0.0.0/99".into()];
        let spec = ProfileSpec { ingress_rules: vec![rule], ..ProfileSpec::default() };
        let out = ProfileProcessor::new().process(&profile(spec)).unwrap();
        assert!(out.iter().all(KvPair::is_deletion));
    }

    #[test]
    fn undecodable_spec_is_treated_as_deletion() {
        let r = Resource::new(Kind::PROFILE, "default", serde_json::json!({ "ingressRules": "nope" }));
        let out = ProfileProcessor::new().process(&ResourceUpdate::upsert(r)).unwrap();
        assert!(out.iter().all(KvPair::is_deletion));
    }

    #[test]
    fn processing_is_pure() {
        let mut spec = ProfileSpec::default();
        spec.labels_to_apply.insert("a".into(), "b".into());
        let update = profile(spec);
        let mut p = ProfileProcessor::new();
        assert_eq!(p.process(&update).unwrap(), p.process(&update).unwrap());
    }

    #[test]
    fn wrong_kind_is_a_contract_violation() {
        let update = ResourceUpdate::deletion(ResourceKey::new(Kind::BGP_PEER, "p"), None);
        let err = ProfileProcessor::new().process(&update).unwrap_err();
        assert_eq!(err.to_string(), "incorrect key type - expecting resource of kind Profile, got BGPPeer");
        assert!(matches!(err, Error::KindMismatch { .. }));
    }
}
