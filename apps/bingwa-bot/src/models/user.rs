use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram-side identity as seen on an inbound update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl UserProfile {
    pub fn display_name(&self) -> &str {
        self.first_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("Valued Customer")
    }
}

/// One entry of `user_data.json`. Ids are stored as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(with = "id_as_string")]
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, with = "flexible_time")]
    pub joined: Option<DateTime<Utc>>,
    #[serde(default, with = "flexible_time")]
    pub last_active: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn new(profile: &UserProfile, now: DateTime<Utc>) -> Self {
        Self {
            id: profile.id,
            username: profile.username.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            joined: Some(now),
            last_active: Some(now),
        }
    }

    pub fn touch(&mut self, profile: &UserProfile, now: DateTime<Utc>) {
        self.username = profile.username.clone();
        self.first_name = profile.first_name.clone();
        self.last_name = profile.last_name.clone();
        self.last_active = Some(now);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UserFile {
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

mod id_as_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }
        match Raw::deserialize(d)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.trim().parse().map_err(de::Error::custom),
        }
    }
}

/// Accepts RFC 3339 and offset-less `isoformat()` timestamps. Offset-less
/// values are read as UTC. Always written back as RFC 3339.
mod flexible_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&t.to_rfc3339()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        parse(raw)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp: {}", raw)))
    }

    fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Some(t.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
            .map(|t| t.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_legacy_records_with_string_ids() {
        let raw = r#"{"users": [
            {"id": "42", "username": null, "first_name": "Wanjiku", "last_name": null,
             "joined": "2024-01-01T10:00:00Z", "last_active": "2024-01-02T10:00:00Z"},
            {"id": 7}
        ]}"#;
        let file: UserFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.users[0].id, 42);
        assert_eq!(file.users[1].id, 7);
        assert!(file.users[1].joined.is_none());

        let out = serde_json::to_value(&file.users[0]).unwrap();
        assert_eq!(out["id"], "42");
    }

    #[test]
    fn reads_offsetless_timestamps_as_utc() {
        let raw = r#"{"users": [
            {"id": "42", "first_name": "Otieno",
             "joined": "2024-05-01T10:00:00.123456", "last_active": "2024-05-02T08:30:00"}
        ]}"#;
        let file: UserFile = serde_json::from_str(raw).unwrap();
        let joined = file.users[0].joined.unwrap();
        assert_eq!(joined.to_rfc3339(), "2024-05-01T10:00:00.123456+00:00");
        assert_eq!(
            file.users[0].last_active,
            Some("2024-05-02T08:30:00Z".parse::<DateTime<Utc>>().unwrap())
        );

        let out = serde_json::to_value(&file.users[0]).unwrap();
        assert_eq!(out["last_active"], "2024-05-02T08:30:00+00:00");
    }

    #[test]
    fn garbage_timestamp_is_an_error() {
        let raw = r#"{"users": [{"id": "1", "joined": "yesterday"}]}"#;
        assert!(serde_json::from_str::<UserFile>(raw).is_err());
    }

    #[test]
    fn display_name_falls_back() {
        let anon = UserProfile { id: 1, ..Default::default() };
        assert_eq!(anon.display_name(), "Valued Customer");
    }
}
