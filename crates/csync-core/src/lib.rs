//! Core contact model, identifier precedence and reverse patch computation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "csync-core";

/// Birthday assembled from one or more remote birthday entries; each part is independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Birthday {
    pub day: Option<u32>,
    pub month: Option<u32>,
    pub year: Option<i32>,
}

impl Birthday {
    pub fn is_empty(&self) -> bool {
        self.day.is_none() && self.month.is_none() && self.year.is_none()
    }
}

/// How several birthday entries on one remote record collapse into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BirthdayMerge {
    /// Later entries overwrite earlier ones part by part. A later entry carrying only a
    /// year keeps the day and month of an earlier entry.
    #[default]
    PerField,
    /// The last entry replaces everything before it.
    WholeEntry,
}

impl BirthdayMerge {
    pub fn merge(self, entries: impl IntoIterator<Item = Birthday>) -> Option<Birthday> {
        let mut merged: Option<Birthday> = None;
        for entry in entries {
            merged = Some(match (self, merged) {
                (BirthdayMerge::PerField, Some(prev)) => Birthday {
                    day: entry.day.or(prev.day),
                    month: entry.month.or(prev.month),
                    year: entry.year.or(prev.year),
                },
                _ => entry,
            });
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoSource {
    Explicit,
    ProfileDefault,
}

/// Two-slot photo selection: a photo attached by the user beats the profile picture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoSlots {
    explicit: Option<String>,
    profile_default: Option<String>,
}

impl PhotoSlots {
    pub fn offer(&mut self, source: PhotoSource, url: impl Into<String>) {
        let slot = match source {
            PhotoSource::Explicit => &mut self.explicit,
            PhotoSource::ProfileDefault => &mut self.profile_default,
        };
        *slot = Some(url.into());
    }

    pub fn resolve(self) -> Option<String> {
        self.explicit.or(self.profile_default)
    }
}

/// Typed foreign identifier attached to a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalId {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// A phone number as the remote directory holds it.
///
/// `value` and `label` are written back untouched; only `canonical_form` takes part in
/// identification and stale-phone pruning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PhoneEntry {
    pub value: String,
    pub canonical_form: Option<String>,
    pub label: Option<String>,
}

impl PhoneEntry {
    /// Entry whose display value already is its canonical form.
    pub fn canonical(number: impl Into<String>) -> Self {
        let number = number.into();
        Self {
            value: number.clone(),
            canonical_form: Some(number),
            label: None,
        }
    }
}

/// One remote directory entry after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteRecord {
    pub remote_id: String,
    pub etag: Option<String>,
    /// Never empty; the configured unknown-contact sentinel stands in for a missing primary name.
    pub display_name: String,
    /// Every display name the source carries, in source order.
    pub names: Vec<String>,
    pub emails: Vec<String>,
    pub phones: Vec<PhoneEntry>,
    pub birthday: Option<Birthday>,
    pub photo_url: Option<String>,
    pub memberships: BTreeSet<String>,
    pub external_ids: Vec<ExternalId>,
    pub registry_tag: Option<String>,
}

impl RemoteRecord {
    pub fn has_membership(&self, group: &str) -> bool {
        self.memberships.contains(group)
    }

    /// Canonical forms of the record's phones, in source order. Unparsed numbers are skipped.
    pub fn canonical_phones(&self) -> impl Iterator<Item = &str> {
        self.phones
            .iter()
            .filter_map(|phone| phone.canonical_form.as_deref())
    }
}

pub fn resolve_display_name(primary: Option<&str>, unknown_name: &str) -> String {
    match primary.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => unknown_name.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    RegistryTag,
    RemoteSystemId,
    Phone,
    Email,
    Name,
}

impl IdentifierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierKind::RegistryTag => "registry_tag",
            IdentifierKind::RemoteSystemId => "remote_system_id",
            IdentifierKind::Phone => "phone",
            IdentifierKind::Email => "email",
            IdentifierKind::Name => "name",
        }
    }
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key used to look a person up in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateIdentifier {
    RegistryTag(String),
    RemoteSystemId(String),
    Phone(String),
    Email(String),
    Name(String),
}

impl CandidateIdentifier {
    pub fn kind(&self) -> IdentifierKind {
        match self {
            CandidateIdentifier::RegistryTag(_) => IdentifierKind::RegistryTag,
            CandidateIdentifier::RemoteSystemId(_) => IdentifierKind::RemoteSystemId,
            CandidateIdentifier::Phone(_) => IdentifierKind::Phone,
            CandidateIdentifier::Email(_) => IdentifierKind::Email,
            CandidateIdentifier::Name(_) => IdentifierKind::Name,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            CandidateIdentifier::RegistryTag(v)
            | CandidateIdentifier::RemoteSystemId(v)
            | CandidateIdentifier::Phone(v)
            | CandidateIdentifier::Email(v)
            | CandidateIdentifier::Name(v) => v,
        }
    }
}

/// Identifiers in precedence order: prior registry tag, remote id, phones, emails, names.
///
/// A present registry tag always comes first and the matcher stops there without a lookup.
/// The remaining identifiers are still listed after it on purpose: the same list feeds the
/// registry import, which should see every known fact about the person.
pub fn build_identifiers(record: &RemoteRecord) -> Vec<CandidateIdentifier> {
    let mut out = Vec::with_capacity(
        2 + record.phones.len() + record.emails.len() + record.names.len(),
    );
    if let Some(tag) = record.registry_tag.as_deref().filter(|t| !t.is_empty()) {
        out.push(CandidateIdentifier::RegistryTag(tag.to_string()));
    }
    if !record.remote_id.is_empty() {
        out.push(CandidateIdentifier::RemoteSystemId(record.remote_id.clone()));
    }
    out.extend(
        record
            .canonical_phones()
            .map(|phone| CandidateIdentifier::Phone(phone.to_string())),
    );
    out.extend(record.emails.iter().cloned().map(CandidateIdentifier::Email));
    out.extend(record.names.iter().cloned().map(CandidateIdentifier::Name));
    out
}

/// Result of walking an identifier list against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(String),
    NoMatch,
    Ambiguous,
}

/// The registry's authoritative view of a person. Read-only to this engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalAgent {
    pub id: String,
    pub name: String,
    pub active_phones: BTreeSet<String>,
    pub is_deceased: bool,
    pub is_starred: bool,
}

/// International-to-domestic prefix substitution used before comparing phones with the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhonePrefixRule {
    pub international: String,
    pub domestic: String,
}

impl Default for PhonePrefixRule {
    fn default() -> Self {
        Self {
            international: "+44".to_string(),
            domestic: "0".to_string(),
        }
    }
}

impl PhonePrefixRule {
    pub fn to_domestic(&self, phone: &str) -> String {
        match phone.strip_prefix(self.international.as_str()) {
            Some(rest) if !self.international.is_empty() => format!("{}{rest}", self.domestic),
            _ => phone.to_string(),
        }
    }
}

/// Remote group names that mirror the registry's life-status flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipMarkers {
    pub deceased: String,
    pub starred: String,
}

impl Default for MembershipMarkers {
    fn default() -> Self {
        Self {
            deceased: "contactGroups/deceased".to_string(),
            starred: "contactGroups/starred".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRules {
    pub markers: MembershipMarkers,
    pub phone_prefix: PhonePrefixRule,
    pub identity_tag_type: String,
}

/// Field changes to push back onto one remote record. Never mutates the record itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patch {
    pub name_override: Option<String>,
    pub membership_additions: BTreeSet<String>,
    pub membership_removals: BTreeSet<String>,
    /// Canonical forms of the phones to drop.
    pub phone_removals: Vec<String>,
    pub identifier_stamp: Option<ExternalId>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.name_override.is_none()
            && self.membership_additions.is_empty()
            && self.membership_removals.is_empty()
            && self.phone_removals.is_empty()
            && self.identifier_stamp.is_none()
    }

    fn reconcile_membership(&mut self, record: &RemoteRecord, group: &str, wanted: bool) {
        match (wanted, record.has_membership(group)) {
            (true, false) => {
                self.membership_additions.insert(group.to_string());
            }
            (false, true) => {
                self.membership_removals.insert(group.to_string());
            }
            _ => {}
        }
    }

    /// Combine the untouched record with this patch into the values to transmit.
    /// Returns `None` when there is nothing to send.
    pub fn render(&self, record: &RemoteRecord) -> Option<RecordUpdate> {
        if self.is_empty() {
            return None;
        }

        let memberships = if self.membership_additions.is_empty()
            && self.membership_removals.is_empty()
        {
            None
        } else {
            Some(
                record
                    .memberships
                    .iter()
                    .filter(|group| !self.membership_removals.contains(*group))
                    .chain(self.membership_additions.iter())
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect(),
            )
        };

        let phones = if self.phone_removals.is_empty() {
            None
        } else {
            Some(
                record
                    .phones
                    .iter()
                    .filter(|phone| {
                        phone
                            .canonical_form
                            .as_ref()
                            .map_or(true, |canonical| !self.phone_removals.contains(canonical))
                    })
                    .cloned()
                    .collect(),
            )
        };

        let external_ids = self.identifier_stamp.as_ref().map(|stamp| {
            let mut ids: Vec<ExternalId> = record
                .external_ids
                .iter()
                .filter(|id| id.kind != stamp.kind)
                .cloned()
                .collect();
            ids.push(stamp.clone());
            ids
        });

        Some(RecordUpdate {
            remote_id: record.remote_id.clone(),
            etag: record.etag.clone(),
            name: self.name_override.clone(),
            memberships,
            phones,
            external_ids,
        })
    }
}

/// Diff the registry's authoritative agent against the remote record it came from.
pub fn compute_patch(agent: &CanonicalAgent, record: &RemoteRecord, rules: &PatchRules) -> Patch {
    let mut patch = Patch::default();

    if agent.name != record.display_name {
        patch.name_override = Some(agent.name.clone());
    }

    patch.reconcile_membership(record, &rules.markers.deceased, agent.is_deceased);
    patch.reconcile_membership(record, &rules.markers.starred, agent.is_starred);

    patch.phone_removals = record
        .canonical_phones()
        .filter(|phone| {
            !agent
                .active_phones
                .contains(&rules.phone_prefix.to_domestic(phone))
        })
        .map(str::to_string)
        .collect();

    if record.registry_tag.as_deref() != Some(agent.id.as_str()) {
        patch.identifier_stamp = Some(ExternalId {
            kind: rules.identity_tag_type.clone(),
            value: agent.id.clone(),
        });
    }

    patch
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateField {
    Names,
    Memberships,
    PhoneNumbers,
    ExternalIds,
}

impl UpdateField {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateField::Names => "names",
            UpdateField::Memberships => "memberships",
            UpdateField::PhoneNumbers => "phoneNumbers",
            UpdateField::ExternalIds => "externalIds",
        }
    }
}

/// Full replacement values for the fields a patch touches on one remote record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub remote_id: String,
    pub etag: Option<String>,
    pub name: Option<String>,
    pub memberships: Option<Vec<String>>,
    pub phones: Option<Vec<PhoneEntry>>,
    pub external_ids: Option<Vec<ExternalId>>,
}

impl RecordUpdate {
    pub fn update_mask(&self) -> BTreeSet<UpdateField> {
        let mut mask = BTreeSet::new();
        if self.name.is_some() {
            mask.insert(UpdateField::Names);
        }
        if self.memberships.is_some() {
            mask.insert(UpdateField::Memberships);
        }
        if self.phones.is_some() {
            mask.insert(UpdateField::PhoneNumbers);
        }
        if self.external_ids.is_some() {
            mask.insert(UpdateField::ExternalIds);
        }
        mask
    }
}
