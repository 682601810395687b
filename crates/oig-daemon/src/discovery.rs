//! Home-Assistant-style MQTT discovery template emission.
//!
//! Pure data template, no business logic. One retained config payload per
//! `(table, item)` pair, under
//! `homeassistant/sensor/{device_id}_{table}_{item}/config`.

use oig_bus::BusConfig;
use serde_json::{json, Value};

/// A single sensor's discovery identity and optional display hints.
#[derive(Debug, Clone)]
pub struct SensorDescriptor {
    pub table: String,
    pub item: String,
    pub unit: Option<String>,
    pub device_class: Option<String>,
}

pub fn discovery_topic(device_id: &str, table: &str, item: &str) -> String {
    format!("homeassistant/sensor/{device_id}_{table}_{item}/config")
}

/// Builds the discovery config payload for one sensor, pointing at the
/// proxy's own retained state topic for its value.
pub fn discovery_payload(bus: &BusConfig, device_id: &str, sensor: &SensorDescriptor) -> Value {
    let unique_id = format!("{device_id}_{}_{}", sensor.table, sensor.item);
    let mut payload = json!({
        "name": format!("{} {}", sensor.table, sensor.item),
        "unique_id": unique_id,
        "state_topic": bus.state_topic(&sensor.table),
        "value_template": format!("{{{{ value_json.{} }}}}", sensor.item),
        "availability_topic": bus.availability_topic(),
        "payload_available": "online",
        "payload_not_available": "offline",
        "device": {
            "identifiers": [device_id],
            "name": format!("OIG BOX {device_id}"),
            "manufacturer": "OIG",
        },
    });
    if let Some(unit) = &sensor.unit {
        payload["unit_of_measurement"] = json!(unit);
    }
    if let Some(class) = &sensor.device_class {
        payload["device_class"] = json!(class);
    }
    payload
}

/// Publishes a discovery config payload (retained) for every sensor known
/// up front. Additional tables observed at runtime get no discovery entry
/// unless they're in this fixed map — matching the template's intent of
/// covering the common, enumerated sensor set rather than every ad hoc
/// field the BOX happens to emit.
pub fn default_sensor_map() -> Vec<SensorDescriptor> {
    vec![
        SensorDescriptor {
            table: "tbl_box_prms".to_string(),
            item: "MODE".to_string(),
            unit: None,
            device_class: None,
        },
        SensorDescriptor {
            table: "tbl_box_prms".to_string(),
            item: "SA".to_string(),
            unit: None,
            device_class: None,
        },
        SensorDescriptor {
            table: "tbl_actual".to_string(),
            item: "Pgrid".to_string(),
            unit: Some("W".to_string()),
            device_class: Some("power".to_string()),
        },
        SensorDescriptor {
            table: "tbl_actual".to_string(),
            item: "Pbat".to_string(),
            unit: Some("W".to_string()),
            device_class: Some("power".to_string()),
        },
        SensorDescriptor {
            table: "tbl_batt_prms".to_string(),
            item: "BatCurrent".to_string(),
            unit: Some("A".to_string()),
            device_class: Some("current".to_string()),
        },
    ]
}
