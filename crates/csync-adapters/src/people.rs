//! People-API-shaped remote directory: raw record types, normalization and HTTP binding.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use async_trait::async_trait;
use csync_core::{
    resolve_display_name, Birthday, BirthdayMerge, ExternalId, PhoneEntry, PhotoSlots,
    PhotoSource, RecordUpdate, RemoteRecord, UpdateField,
};
use csync_transport::{classify_status, HttpClientConfig, HttpTransport, ResponseSnapshot, StatusClass};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AdapterError, RemoteDirectory};

pub const PERSON_FIELDS: &str =
    "names,emailAddresses,birthdays,phoneNumbers,photos,externalIds,memberships,metadata";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub names: Vec<PersonName>,
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
    #[serde(default)]
    pub phone_numbers: Vec<PhoneNumber>,
    #[serde(default)]
    pub birthdays: Vec<BirthdayEntry>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub external_ids: Vec<ExternalId>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMetadata {
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub source: Option<FieldSource>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldSource {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub metadata: FieldMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EmailAddress {
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub canonical_form: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl PhoneNumber {
    fn to_entry(&self) -> Option<PhoneEntry> {
        let value = self.value.clone().or_else(|| self.canonical_form.clone())?;
        Some(PhoneEntry {
            value,
            canonical_form: self.canonical_form.clone(),
            label: self.kind.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BirthdayEntry {
    #[serde(default)]
    pub date: Option<Birthday>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub metadata: FieldMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    #[serde(default)]
    pub contact_group_membership: Option<ContactGroupMembership>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactGroupMembership {
    pub contact_group_resource_name: String,
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub unknown_name: String,
    pub identity_tag_type: String,
    pub birthday_merge: BirthdayMerge,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            unknown_name: "Unknown Google Contact".to_string(),
            identity_tag_type: "lucos_contacts".to_string(),
            birthday_merge: BirthdayMerge::PerField,
        }
    }
}

fn photo_source(photo: &Photo) -> Option<PhotoSource> {
    match photo.metadata.source.as_ref()?.kind.as_str() {
        "CONTACT" => Some(PhotoSource::Explicit),
        "PROFILE" => Some(PhotoSource::ProfileDefault),
        _ => None,
    }
}

/// Map a raw directory entry onto a `RemoteRecord`. Missing parts become absent values.
pub fn normalize_person(person: &Person, options: &NormalizeOptions) -> RemoteRecord {
    let primary = person
        .names
        .iter()
        .filter(|n| n.metadata.primary)
        .filter_map(|n| n.display_name.as_deref())
        .last();

    let birthday = options
        .birthday_merge
        .merge(person.birthdays.iter().filter_map(|b| b.date))
        .filter(|b| !b.is_empty());

    let mut photos = PhotoSlots::default();
    for photo in person.photos.iter().filter(|p| !p.default) {
        if let (Some(source), Some(url)) = (photo_source(photo), photo.url.as_deref()) {
            photos.offer(source, url);
        }
    }

    let registry_tag = person
        .external_ids
        .iter()
        .filter(|id| id.kind == options.identity_tag_type)
        .map(|id| id.value.clone())
        .last();

    RemoteRecord {
        remote_id: person.resource_name.clone(),
        etag: person.etag.clone(),
        display_name: resolve_display_name(primary, &options.unknown_name),
        names: person
            .names
            .iter()
            .filter_map(|n| n.display_name.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect(),
        emails: person
            .email_addresses
            .iter()
            .filter_map(|e| e.value.clone())
            .collect(),
        phones: person
            .phone_numbers
            .iter()
            .filter_map(PhoneNumber::to_entry)
            .collect(),
        birthday,
        photo_url: photos.resolve(),
        memberships: person
            .memberships
            .iter()
            .filter_map(|m| m.contact_group_membership.as_ref())
            .map(|m| m.contact_group_resource_name.clone())
            .collect::<BTreeSet<_>>(),
        external_ids: person.external_ids.clone(),
        registry_tag,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactGroupResponse {
    #[serde(default)]
    member_resource_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchGetResponse {
    #[serde(default)]
    responses: Vec<PersonResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonResponse {
    #[serde(default)]
    requested_resource_name: Option<String>,
    #[serde(default)]
    person: Option<Person>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateRequest {
    contacts: BTreeMap<String, PersonUpdate>,
    update_mask: String,
    read_mask: &'static str,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PersonUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    names: Option<Vec<NameUpdate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memberships: Option<Vec<MembershipUpdate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_numbers: Option<Vec<PhoneUpdate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_ids: Option<Vec<ExternalId>>,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct NameUpdate {
    unstructured_name: String,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct MembershipUpdate {
    contact_group_membership: GroupRef,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupRef {
    contact_group_resource_name: String,
}

#[derive(Debug, PartialEq, Serialize)]
struct PhoneUpdate {
    value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

impl From<&RecordUpdate> for PersonUpdate {
    fn from(update: &RecordUpdate) -> Self {
        Self {
            etag: update.etag.clone(),
            names: update.name.as_ref().map(|name| {
                vec![NameUpdate {
                    unstructured_name: name.clone(),
                }]
            }),
            memberships: update.memberships.as_ref().map(|groups| {
                groups
                    .iter()
                    .map(|group| MembershipUpdate {
                        contact_group_membership: GroupRef {
                            contact_group_resource_name: group.clone(),
                        },
                    })
                    .collect()
            }),
            phone_numbers: update.phones.as_ref().map(|phones| {
                phones
                    .iter()
                    .map(|phone| PhoneUpdate {
                        value: phone.value.clone(),
                        kind: phone.label.clone(),
                    })
                    .collect()
            }),
            external_ids: update.external_ids.clone(),
        }
    }
}

fn mask_string(mask: &BTreeSet<UpdateField>) -> String {
    mask.iter()
        .map(|field| field.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// One request per batch; every member must touch exactly the same fields, since the
/// directory clears any masked field a contact's body leaves out.
fn batch_update_request(updates: &[RecordUpdate]) -> Result<BatchUpdateRequest, AdapterError> {
    let mask = updates.first().map(RecordUpdate::update_mask).unwrap_or_default();
    if let Some(odd) = updates.iter().find(|u| u.update_mask() != mask) {
        return Err(AdapterError::Message(format!(
            "batch_update: {} updates {} but the batch updates {}",
            odd.remote_id,
            mask_string(&odd.update_mask()),
            mask_string(&mask)
        )));
    }
    Ok(BatchUpdateRequest {
        contacts: updates
            .iter()
            .map(|u| (u.remote_id.clone(), PersonUpdate::from(u)))
            .collect(),
        update_mask: mask_string(&mask),
        read_mask: "metadata",
    })
}

#[derive(Debug, Clone)]
pub struct PeopleDirectoryConfig {
    pub base_url: String,
    pub access_token: String,
    pub normalize: NormalizeOptions,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct PeopleDirectory {
    base_url: String,
    normalize: NormalizeOptions,
    http: HttpTransport,
}

impl PeopleDirectory {
    pub fn new(config: PeopleDirectoryConfig) -> anyhow::Result<Self> {
        let mut http_config = config.http;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.access_token))
            .context("remote directory access token is not a valid header value")?;
        http_config.default_headers.insert(AUTHORIZATION, bearer);
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            normalize: config.normalize,
            http: HttpTransport::new("remote-directory", http_config)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn expect_json<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, AdapterError> {
        let resp = self.http.send(stage, request).await?;
        let status = resp.status();
        let snapshot = ResponseSnapshot::capture(stage, resp).await?;
        if classify_status(status) != StatusClass::Success {
            return Err(AdapterError::from_snapshot(stage, snapshot));
        }
        serde_json::from_str(&snapshot.body).map_err(|source| AdapterError::Decode { stage, source })
    }
}

#[async_trait]
impl RemoteDirectory for PeopleDirectory {
    async fn group_members(
        &self,
        group: &str,
        max_members: usize,
    ) -> Result<Vec<String>, AdapterError> {
        let request = self
            .http
            .client()
            .get(self.url(group))
            .query(&[("maxMembers", max_members.to_string())]);
        let body: ContactGroupResponse = self.expect_json("group_members", request).await?;
        Ok(body.member_resource_names)
    }

    async fn batch_get(&self, remote_ids: &[String]) -> Result<Vec<RemoteRecord>, AdapterError> {
        let mut query: Vec<(&str, &str)> = remote_ids
            .iter()
            .map(|id| ("resourceNames", id.as_str()))
            .collect();
        query.push(("personFields", PERSON_FIELDS));
        let request = self
            .http
            .client()
            .get(self.url("people:batchGet"))
            .query(&query);
        let body: BatchGetResponse = self.expect_json("batch_get", request).await?;
        if body.responses.len() != remote_ids.len() {
            return Err(AdapterError::Message(format!(
                "batch_get: requested {} records, received {}",
                remote_ids.len(),
                body.responses.len()
            )));
        }

        let mut records = Vec::with_capacity(body.responses.len());
        for (requested, response) in remote_ids.iter().zip(body.responses) {
            let Some(mut person) = response.person else {
                return Err(AdapterError::Message(format!(
                    "batch_get: no record returned for {}",
                    response.requested_resource_name.as_deref().unwrap_or(requested)
                )));
            };
            if person.resource_name.is_empty() {
                person.resource_name = requested.clone();
            }
            records.push(normalize_person(&person, &self.normalize));
        }
        debug!(requested = remote_ids.len(), returned = records.len(), "batch_get page");
        Ok(records)
    }

    async fn batch_update(&self, updates: &[RecordUpdate]) -> Result<(), AdapterError> {
        if updates.is_empty() {
            return Ok(());
        }
        let request = self
            .http
            .client()
            .post(self.url("people:batchUpdateContacts"))
            .json(&batch_update_request(updates)?);
        let _: serde_json::Value = self.expect_json("batch_update", request).await?;
        Ok(())
    }
}
