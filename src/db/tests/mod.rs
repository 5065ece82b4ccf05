
use crate::types::StoreKey;
use chrono::{DateTime, Utc};

pub(super) fn key(name: &str) -> StoreKey {
    StoreKey::new(name).unwrap()
}

pub(super) fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}
