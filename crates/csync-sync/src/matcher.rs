//! Identity matching and registry import for one normalized record.

use anyhow::{Context, Result};
use csync_adapters::{IdentifyResult, ImportRequest, Registry};
use csync_core::{CandidateIdentifier, CanonicalAgent, MatchOutcome, RemoteRecord};
use tracing::{debug, warn};

/// Walk identifiers in precedence order and return the first clean registry match.
///
/// A leading registry tag is trusted without a lookup. Conflicts are logged and skipped;
/// only a list that produced a conflict and no match comes back `Ambiguous`. Server
/// failures abort the whole run.
pub async fn match_identity(
    registry: &dyn Registry,
    identifiers: &[CandidateIdentifier],
    display_name: &str,
) -> Result<MatchOutcome> {
    if let Some(CandidateIdentifier::RegistryTag(tag)) = identifiers.first() {
        return Ok(MatchOutcome::Matched(tag.clone()));
    }

    let mut conflicted = false;
    for identifier in identifiers {
        if matches!(identifier, CandidateIdentifier::RegistryTag(_)) {
            continue;
        }
        let result = registry.identify(identifier).await.with_context(|| {
            format!(
                "identifying {display_name} by {} {}",
                identifier.kind(),
                identifier.value()
            )
        })?;
        match result {
            IdentifyResult::Found(agent_id) => {
                debug!(
                    display_name,
                    identifier = %identifier.kind(),
                    agent_id = %agent_id,
                    "registry match"
                );
                return Ok(MatchOutcome::Matched(agent_id));
            }
            IdentifyResult::Conflict => {
                warn!(
                    display_name,
                    identifier = %identifier.kind(),
                    value = identifier.value(),
                    "multiple registry agents match identifier"
                );
                conflicted = true;
            }
            IdentifyResult::NotFound => {}
        }
    }

    Ok(if conflicted {
        MatchOutcome::Ambiguous
    } else {
        MatchOutcome::NoMatch
    })
}

/// Identifier list sent to the import call: the resolved agent first, then everything else.
pub fn import_identifiers(
    agent_id: &str,
    identifiers: &[CandidateIdentifier],
) -> Vec<CandidateIdentifier> {
    std::iter::once(CandidateIdentifier::RegistryTag(agent_id.to_string()))
        .chain(
            identifiers
                .iter()
                .filter(|id| !matches!(id, CandidateIdentifier::RegistryTag(_)))
                .cloned(),
        )
        .collect()
}

/// Upsert one record into the registry and return its authoritative state.
pub async fn import_record(
    registry: &dyn Registry,
    agent_id: &str,
    identifiers: &[CandidateIdentifier],
    record: &RemoteRecord,
) -> Result<CanonicalAgent> {
    let request = ImportRequest {
        identifiers: import_identifiers(agent_id, identifiers),
        birthday: record.birthday,
    };
    registry
        .import(&request)
        .await
        .with_context(|| format!("importing {} as agent {agent_id}", record.display_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;
    use csync_core::{build_identifiers, IdentifierKind, PhoneEntry};

    fn alex() -> RemoteRecord {
        RemoteRecord {
            remote_id: "people/c1".into(),
            display_name: "Alex".into(),
            names: vec!["Alex".into()],
            phones: vec![PhoneEntry::canonical("+447700900000")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn registry_tag_is_trusted_without_lookup() {
        let registry = FakeRegistry::default();
        let mut record = alex();
        record.registry_tag = Some("17".into());

        let outcome = match_identity(&registry, &build_identifiers(&record), "Alex")
            .await
            .expect("match");
        assert_eq!(outcome, MatchOutcome::Matched("17".into()));
        assert_eq!(registry.identify_calls(), 0);
    }

    #[tokio::test]
    async fn conflict_does_not_short_circuit() {
        let registry = FakeRegistry::default()
            .with_identify(IdentifierKind::Phone, "+447700900000", IdentifyResult::Conflict)
            .with_identify(
                IdentifierKind::Email,
                "b@example.com",
                IdentifyResult::Found("8".into()),
            );
        let identifiers = vec![
            CandidateIdentifier::Phone("+447700900000".into()),
            CandidateIdentifier::Email("b@example.com".into()),
        ];

        let outcome = match_identity(&registry, &identifiers, "Alex")
            .await
            .expect("match");
        assert_eq!(outcome, MatchOutcome::Matched("8".into()));
        assert_eq!(registry.identify_calls(), 2);
    }

    #[tokio::test]
    async fn conflict_without_match_is_ambiguous() {
        let registry = FakeRegistry::default().with_identify(
            IdentifierKind::Phone,
            "+447700900000",
            IdentifyResult::Conflict,
        );
        let outcome = match_identity(&registry, &build_identifiers(&alex()), "Alex")
            .await
            .expect("match");
        assert_eq!(outcome, MatchOutcome::Ambiguous);
        assert_eq!(registry.identify_calls(), 3);
    }

    #[tokio::test]
    async fn unmatched_record_reports_no_match() {
        let registry = FakeRegistry::default();
        let identifiers = vec![
            CandidateIdentifier::Phone("+447700900000".into()),
            CandidateIdentifier::Name("Alex".into()),
        ];
        let outcome = match_identity(&registry, &identifiers, "Alex")
            .await
            .expect("match");
        assert_eq!(outcome, MatchOutcome::NoMatch);
        assert_eq!(registry.identify_calls(), 2);
    }

    #[tokio::test]
    async fn first_match_stops_lookup() {
        let registry = FakeRegistry::default().with_identify(
            IdentifierKind::RemoteSystemId,
            "people/c1",
            IdentifyResult::Found("3".into()),
        );
        let outcome = match_identity(&registry, &build_identifiers(&alex()), "Alex")
            .await
            .expect("match");
        assert_eq!(outcome, MatchOutcome::Matched("3".into()));
        assert_eq!(registry.identify_calls(), 1);
    }

    #[tokio::test]
    async fn server_failure_propagates_with_context() {
        let registry = FakeRegistry::default().failing_identify(IdentifierKind::Phone);
        let err = match_identity(&registry, &build_identifiers(&alex()), "Alex")
            .await
            .expect_err("fatal");
        let message = format!("{err:#}");
        assert!(message.starts_with("identifying Alex by phone +447700900000"));
        assert!(message.contains("server error 500"));
    }

    #[tokio::test]
    async fn import_is_idempotent_for_identical_identifiers() {
        let registry = FakeRegistry::default();
        let record = alex();
        let identifiers = build_identifiers(&record);

        let first = import_record(&registry, "5", &identifiers, &record)
            .await
            .expect("first import");
        let second = import_record(&registry, "5", &identifiers, &record)
            .await
            .expect("second import");
        assert_eq!(first.id, second.id);
        assert_eq!(registry.agent_count(), 1);
    }

    #[test]
    fn import_identifiers_lead_with_resolved_agent() {
        let identifiers = vec![
            CandidateIdentifier::RegistryTag("old".into()),
            CandidateIdentifier::Phone("+447700900000".into()),
        ];
        assert_eq!(
            import_identifiers("9", &identifiers),
            vec![
                CandidateIdentifier::RegistryTag("9".into()),
                CandidateIdentifier::Phone("+447700900000".into()),
            ]
        );
    }
}
