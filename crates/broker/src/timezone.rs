//! Zone provider backed by the upstream CLI: the primary calendar's
//! `timeZone` decides how relative time flags are anchored.

use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use serde_json::{json, Map, Value};

use warden_gog::Runner;
use warden_policy::{PolicyError, TimeZoneProvider};

pub struct GogTimeZoneProvider {
    runner: Arc<dyn Runner>,
}

impl GogTimeZoneProvider {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TimeZoneProvider for GogTimeZoneProvider {
    async fn time_zone(&self) -> Result<Tz, PolicyError> {
        let mut params = Map::new();
        params.insert("max".to_string(), json!(250));
        let data = self
            .runner
            .run("calendar.list", &params)
            .await
            .map_err(|err| PolicyError::new(err.to_string()))?;

        let zone = extract_time_zone(&data)
            .ok_or_else(|| PolicyError::new("invalid calendar list response"))?;
        zone.parse::<Tz>()
            .map_err(|_| PolicyError::new(format!("unknown time zone: {zone}")))
    }
}

fn extract_time_zone(data: &Value) -> Option<String> {
    let items = data.as_object()?.get("calendars")?.as_array()?;

    let zone_of = |item: &Value| -> Option<String> {
        item.as_object()?
            .get("timeZone")
            .and_then(Value::as_str)
            .filter(|tz| !tz.is_empty())
            .map(str::to_string)
    };

    for item in items {
        let primary = item
            .as_object()
            .and_then(|m| m.get("primary"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if primary {
            if let Some(zone) = zone_of(item) {
                return Some(zone);
            }
        }
    }
    items.iter().find_map(zone_of)
}
