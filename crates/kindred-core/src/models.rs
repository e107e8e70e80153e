//! Data model for the Kindred core
//!
//! Principals, filter criteria, and conversations. Documents cross the
//! store boundary as `serde_json::Value`; the conversions here own the
//! normalization of legacy fields.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// All known profiles as of the last observed store event.
///
/// Keyed by principal id; `BTreeMap` so iteration order is stable within
/// one snapshot.
pub type DirectorySnapshot = BTreeMap<String, Principal>;

/// Authorization role. The single source of truth for admin-ness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    NonBinary,
}

/// The sixteen MBTI type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mbti {
    INTJ, INTP, ENTJ, ENTP,
    INFJ, INFP, ENFJ, ENFP,
    ISTJ, ISFJ, ESTJ, ESFJ,
    ISTP, ISFP, ESTP, ESFP,
}

/// MBTI temperament group, the granularity the browse filter works at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MbtiGroup {
    Analysts,
    Diplomats,
    Sentinels,
    Explorers,
}

impl Mbti {
    /// Temperament group this type code belongs to.
    pub fn group(&self) -> MbtiGroup {
        use Mbti::*;
        match self {
            INTJ | INTP | ENTJ | ENTP => MbtiGroup::Analysts,
            INFJ | INFP | ENFJ | ENFP => MbtiGroup::Diplomats,
            ISTJ | ISFJ | ESTJ | ESFJ => MbtiGroup::Sentinels,
            ISTP | ISFP | ESTP | ESFP => MbtiGroup::Explorers,
        }
    }
}

/// An authenticated or authenticatable user record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Principal {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub mbti: Mbti,
    pub gender: Gender,
    pub birth_date: NaiveDate,
    /// Derived from `birth_date`; recomputed on signup and profile edits.
    pub age: i32,
    pub bio: String,
    pub avatar_url: Option<String>,
    pub online: bool,
}

/// Persisted form of a Principal.
///
/// Profiles written by a sibling application may carry a legacy `isAdmin`
/// boolean instead of (or alongside) the `role` field. An explicit `role`
/// wins; the legacy flag is consulted only when `role` is absent. Writes go
/// through `Principal`'s `Serialize`, which emits `role` only, so documents
/// are normalized on the next write.
#[derive(Deserialize)]
struct PrincipalRecord {
    id: String,
    username: String,
    email: String,
    role: Option<Role>,
    #[serde(default, rename = "isAdmin")]
    is_admin: Option<bool>,
    mbti: Mbti,
    gender: Gender,
    birth_date: NaiveDate,
    #[serde(default)]
    age: i32,
    #[serde(default)]
    bio: String,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    online: bool,
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let record = PrincipalRecord::deserialize(deserializer)?;
        let role = match record.role {
            Some(role) => role,
            None if record.is_admin.unwrap_or(false) => Role::Admin,
            None => Role::User,
        };
        Ok(Principal {
            id: record.id,
            username: record.username,
            email: record.email,
            role,
            mbti: record.mbti,
            gender: record.gender,
            birth_date: record.birth_date,
            age: record.age,
            bio: record.bio,
            avatar_url: record.avatar_url,
            online: record.online,
        })
    }
}

impl Principal {
    /// Parse a stored profile document, resolving legacy fields.
    pub fn from_document(doc: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }

    /// Serialize for storage. Emits `role` only, never the legacy flag.
    pub fn to_document(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Age in whole years as of the given date.
pub fn age_on(birth_date: NaiveDate, on: NaiveDate) -> i32 {
    let mut age = on.year() - birth_date.year();
    if (on.month(), on.day()) < (birth_date.month(), birth_date.day()) {
        age -= 1;
    }
    age
}

/// Signup input. Carries no age field: age is always derived from
/// `birth_date` at the signup instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub username: String,
    pub email: Option<String>,
    pub password: String,
    pub mbti: Mbti,
    pub gender: Gender,
    pub birth_date: NaiveDate,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl ProfileDraft {
    /// Supplied email, or a deterministic placeholder derived from the
    /// handle (credential stores require a non-empty email).
    pub fn email_or_placeholder(&self) -> String {
        match &self.email {
            Some(email) if !email.is_empty() => email.clone(),
            _ => format!("{}@kindred.local", self.username),
        }
    }
}

/// Browse filter. `None` on an axis means "All".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub mbti_group: Option<MbtiGroup>,
    pub gender: Option<Gender>,
    pub min_age: i32,
    pub max_age: i32,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            mbti_group: None,
            gender: None,
            min_age: 18,
            max_age: 99,
        }
    }
}

impl FilterCriteria {
    /// Predicate for a single profile. Does NOT cover the unconditional
    /// self/admin exclusions; those belong to the directory view.
    pub fn matches(&self, principal: &Principal) -> bool {
        if let Some(group) = self.mbti_group {
            if principal.mbti.group() != group {
                return false;
            }
        }
        if let Some(gender) = self.gender {
            if principal.gender != gender {
                return false;
            }
        }
        principal.age >= self.min_age && principal.age <= self.max_age
    }
}

/// A two-party conversation. `id` is the deterministic conversation key,
/// so the same unordered pair always resolves to the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Sorted participant pair.
    pub participants: [String; 2],
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn birth(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn age_counts_whole_years() {
        let bd = birth(2000, 6, 15);
        assert_eq!(age_on(bd, birth(2026, 6, 14)), 25);
        assert_eq!(age_on(bd, birth(2026, 6, 15)), 26);
        assert_eq!(age_on(bd, birth(2026, 6, 16)), 26);
    }

    #[test]
    fn mbti_groups() {
        assert_eq!(Mbti::INTJ.group(), MbtiGroup::Analysts);
        assert_eq!(Mbti::ENFP.group(), MbtiGroup::Diplomats);
        assert_eq!(Mbti::ESFJ.group(), MbtiGroup::Sentinels);
        assert_eq!(Mbti::ISTP.group(), MbtiGroup::Explorers);
    }

    #[test]
    fn legacy_admin_flag_resolves_when_role_absent() {
        let doc = json!({
            "id": "u1",
            "username": "ana",
            "email": "ana@kindred.local",
            "isAdmin": true,
            "mbti": "INTJ",
            "gender": "female",
            "birth_date": "1999-01-02",
            "age": 27,
        });
        let principal = Principal::from_document(doc).unwrap();
        assert_eq!(principal.role, Role::Admin);
    }

    #[test]
    fn explicit_role_wins_over_legacy_flag() {
        let doc = json!({
            "id": "u1",
            "username": "ana",
            "email": "ana@kindred.local",
            "role": "user",
            "isAdmin": true,
            "mbti": "INTJ",
            "gender": "female",
            "birth_date": "1999-01-02",
            "age": 27,
        });
        let principal = Principal::from_document(doc).unwrap();
        assert_eq!(principal.role, Role::User);
    }

    #[test]
    fn write_normalizes_to_role_only() {
        let doc = json!({
            "id": "u1",
            "username": "ana",
            "email": "ana@kindred.local",
            "isAdmin": true,
            "mbti": "INTJ",
            "gender": "female",
            "birth_date": "1999-01-02",
            "age": 27,
        });
        let principal = Principal::from_document(doc).unwrap();
        let rewritten = principal.to_document().unwrap();
        assert_eq!(rewritten["role"], json!("admin"));
        assert!(rewritten.get("isAdmin").is_none());
    }

    #[test]
    fn placeholder_email_derives_from_handle() {
        let draft = ProfileDraft {
            username: "ana".into(),
            email: None,
            password: "secret".into(),
            mbti: Mbti::INFP,
            gender: Gender::Female,
            birth_date: birth(2000, 1, 1),
            bio: String::new(),
            avatar_url: None,
        };
        assert_eq!(draft.email_or_placeholder(), "ana@kindred.local");
    }

    #[test]
    fn filter_age_bounds_are_inclusive() {
        let doc = json!({
            "id": "u2",
            "username": "bo",
            "email": "bo@kindred.local",
            "role": "user",
            "mbti": "ESTP",
            "gender": "male",
            "birth_date": "2008-01-01",
            "age": 18,
        });
        let principal = Principal::from_document(doc).unwrap();
        let criteria = FilterCriteria { min_age: 18, max_age: 18, ..Default::default() };
        assert!(criteria.matches(&principal));
    }
}
