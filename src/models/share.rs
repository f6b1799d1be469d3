//! Share objects: bearer-token capabilities granting access to one file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

/// A share of a single file.
///
/// The secret token is not part of this struct; it is handed out once in
/// [`ShareWithToken`] and only its digest is persisted.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShareObject {
    pub id: String,

    /// Referenced file. Shares never own the file's lifecycle.
    pub file_id: String,

    pub file_kind: String,

    pub name: Option<String>,

    /// Past this instant the share is inert for token lookups.
    pub valid_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ShareObject {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }
}

/// Returned by share creation only.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ShareWithToken {
    #[serde(flatten)]
    pub share: ShareObject,

    pub token: String,
}

/// Share row joined with its stored token digest.
#[derive(FromRow, Debug)]
pub(crate) struct ShareDigestRow {
    #[sqlx(flatten)]
    pub share: ShareObject,
    pub token_digest: String,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateShareArgs {
    pub file_id: String,
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Patch for a share. `validUntil: null` clears the expiry, an absent
/// field leaves it untouched.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ShareUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub valid_until: Option<Option<DateTime<Utc>>>,
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ListSharesQuery {
    pub file_id: Option<String>,
    pub kind: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn share(valid_until: Option<DateTime<Utc>>) -> ShareObject {
        let now = Utc::now();
        ShareObject {
            id: "s1".into(),
            file_id: "f1".into(),
            file_kind: "reports".into(),
            name: None,
            valid_until,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let now = Utc::now();
        assert!(!share(None).is_expired_at(now));
        assert!(share(Some(now)).is_expired_at(now));
        assert!(share(Some(now - Duration::seconds(1))).is_expired_at(now));
        assert!(!share(Some(now + Duration::seconds(1))).is_expired_at(now));
    }

    #[test]
    fn update_distinguishes_null_from_absent() {
        let absent: ShareUpdate = serde_json::from_value(json!({ "name": "x" })).unwrap();
        assert_eq!(absent.valid_until, None);

        let cleared: ShareUpdate = serde_json::from_value(json!({ "validUntil": null })).unwrap();
        assert_eq!(cleared.valid_until, Some(None));

        let set: ShareUpdate =
            serde_json::from_value(json!({ "validUntil": "2030-01-01T00:00:00Z" })).unwrap();
        assert!(matches!(set.valid_until, Some(Some(_))));
    }

    #[test]
    fn token_is_flattened_next_to_share_fields() {
        let value = serde_json::to_value(ShareWithToken {
            share: share(None),
            token: "secret".into(),
        })
        .unwrap();
        assert_eq!(value["token"], "secret");
        assert_eq!(value["fileId"], "f1");
    }
}
