use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One telemetry message from the agent, with every numeric field optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySample {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub methane_ppm: Option<f64>,
    pub ammonia_ppm: Option<f64>,
    pub alcohol_ppm: Option<f64>,
    /// Sample time in unix seconds as sent by the agent
    pub ts: Option<f64>,
    pub uuid: Option<String>,
}

/// Wire shape. The ESP32 field names take precedence over the generic ones.
#[derive(Deserialize, Default)]
struct TelemetryPayload {
    #[serde(rename = "esp32_tempC", default, deserialize_with = "lenient_number")]
    esp32_temp_c: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    temperature_c: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    esp32_humidity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    humidity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    methane_ppm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    ammonia_ppm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    alcohol_ppm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    ts: Option<f64>,
    #[serde(default, deserialize_with = "lenient_text")]
    uuid: Option<String>,
}

impl TelemetrySample {
    /// Parse one telemetry message. Anything that is not a JSON object yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        if !value.is_object() {
            return None;
        }
        let payload: TelemetryPayload = serde_json::from_value(value).ok()?;
        Some(TelemetrySample {
            temperature: payload.esp32_temp_c.or(payload.temperature_c),
            humidity: payload.esp32_humidity.or(payload.humidity),
            methane_ppm: payload.methane_ppm,
            ammonia_ppm: payload.ammonia_ppm,
            alcohol_ppm: payload.alcohol_ppm,
            ts: payload.ts,
            uuid: payload.uuid,
        })
    }

    /// The payload timestamp when it is usable (present, finite, non-zero)
    pub fn logical_ts(&self) -> Option<f64> {
        self.ts.filter(|ts| ts.is_finite() && *ts != 0.0)
    }
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Zero-suppression repair for one field.
///
/// Missing or non-finite readings keep the previous value. An exact zero is treated as a sensor
/// dropout when a previous value exists. Anything else replaces the previous value.
pub fn merge(previous: Option<f64>, incoming: Option<f64>) -> Option<f64> {
    match incoming {
        None => previous,
        Some(value) if !value.is_finite() => previous,
        Some(value) if value == 0.0 && previous.is_some() => previous,
        Some(value) => Some(value),
    }
}

/// Best-known value per sensor field
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LastGoodTelemetry {
    pub temperature_c: Option<f64>,
    pub humidity: Option<f64>,
    pub methane_ppm: Option<f64>,
    pub ammonia_ppm: Option<f64>,
    pub alcohol_ppm: Option<f64>,
}

/// Forward-fills sensor readings through zero and missing gaps. Never averages.
#[derive(Debug, Default)]
pub struct TelemetrySmoother {
    last_good: LastGoodTelemetry,
    samples: u64,
}

impl TelemetrySmoother {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, sample: &TelemetrySample) -> &LastGoodTelemetry {
        let good = &mut self.last_good;
        good.temperature_c = merge(good.temperature_c, sample.temperature);
        good.humidity = merge(good.humidity, sample.humidity);
        good.methane_ppm = merge(good.methane_ppm, sample.methane_ppm);
        good.ammonia_ppm = merge(good.ammonia_ppm, sample.ammonia_ppm);
        good.alcohol_ppm = merge(good.alcohol_ppm, sample.alcohol_ppm);
        self.samples += 1;
        &self.last_good
    }

    pub fn last_good(&self) -> &LastGoodTelemetry {
        &self.last_good
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Display formatting: large magnitudes as integers, small ones with two decimals.
pub fn format_reading(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => {
            if v.abs() >= 100.0 {
                format!("{}", v.round() as i64)
            } else {
                format!("{:.2}", v)
            }
        }
        _ => "--".to_string(),
    }
}

/// "Last update" label: the sample time when known, otherwise `now`.
pub fn last_update_label(ts: Option<f64>, now: DateTime<Local>) -> String {
    let when = ts
        .filter(|t| t.is_finite() && *t != 0.0)
        .and_then(local_time)
        .unwrap_or(now);
    format!("Last update: {}", when.format("%Y-%m-%d %H:%M:%S"))
}

pub(crate) fn local_time(ts: f64) -> Option<DateTime<Local>> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    Local.timestamp_opt(secs as i64, nanos).single()
}
