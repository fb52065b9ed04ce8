//! Command catalog: JSON payload templates keyed by device profile and
//! command, with per-version command overrides and field substitution.

use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, Version};
use serde_json::{Value, json};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEV_TYPE_DEFAULT: &str = "default";
pub const DEV_TYPE_DEVICE22: &str = "device22";
pub const DEV_TYPE_ZIGBEE: &str = "zigbee";

/// A catalog row: the JSON skeleton to fill in, plus the command code that
/// actually goes on the wire when it differs from the one looked up.
struct Template {
    command_override: Option<CommandType>,
    command: Value,
}

fn default_template(cmd: CommandType) -> Option<Template> {
    use CommandType::*;
    let t = match cmd {
        ApConfig => Template {
            command_override: None,
            command: json!({"gwId": "", "devId": "", "uid": "", "t": ""}),
        },
        Control => Template {
            command_override: None,
            command: json!({"devId": "", "uid": "", "t": ""}),
        },
        Status => Template {
            command_override: None,
            command: json!({"gwId": "", "devId": ""}),
        },
        HeartBeat => Template {
            command_override: None,
            command: json!({"gwId": "", "devId": ""}),
        },
        DpQuery => Template {
            command_override: None,
            command: json!({"gwId": "", "devId": "", "uid": "", "t": ""}),
        },
        ControlNew | DpQueryNew => Template {
            command_override: None,
            command: json!({"devId": "", "uid": "", "t": ""}),
        },
        UpdateDps => Template {
            command_override: None,
            command: json!({"dpId": [18, 19, 20]}),
        },
        LanExtStream => Template {
            command_override: None,
            command: json!({"reqType": "", "data": {}}),
        },
        _ => return None,
    };
    Some(t)
}

/// Overlay rows for protocol 3.4/3.5: control moves to the nested
/// `protocol/data` shape and the dp-query family is renumbered.
fn v34_template(cmd: CommandType) -> Option<Template> {
    use CommandType::*;
    let t = match cmd {
        Control => Template {
            command_override: Some(ControlNew),
            command: json!({"protocol": 5, "t": "int", "data": {}}),
        },
        ControlNew => Template {
            command_override: None,
            command: json!({"protocol": 5, "t": "int", "data": {}}),
        },
        DpQuery => Template {
            command_override: Some(DpQueryNew),
            command: json!({}),
        },
        _ => return None,
    };
    Some(t)
}

fn device22_template(cmd: CommandType) -> Option<Template> {
    match cmd {
        CommandType::DpQuery => Some(Template {
            command_override: Some(CommandType::ControlNew),
            command: json!({"devId": "", "uid": "", "t": ""}),
        }),
        _ => None,
    }
}

fn zigbee_template(cmd: CommandType) -> Option<Template> {
    use CommandType::*;
    match cmd {
        Control | DpQuery => Some(Template {
            command_override: None,
            command: json!({"t": "int", "cid": ""}),
        }),
        _ => None,
    }
}

/// Catalog lookup: start from `default`, overlay the version profile, then
/// the device-type profile. Later overlays win at command granularity.
fn lookup(dev_type: &str, version: Version, cmd: CommandType) -> Result<Template> {
    let dev_entry = match dev_type {
        DEV_TYPE_DEFAULT => None,
        DEV_TYPE_DEVICE22 => device22_template(cmd),
        DEV_TYPE_ZIGBEE => zigbee_template(cmd),
        other => {
            return Err(TuyaError::Configuration(format!(
                "unknown device profile '{}'",
                other
            )));
        }
    };
    let version_entry = if version >= Version::V3_4 {
        v34_template(cmd)
    } else {
        None
    };

    Ok(dev_entry
        .or(version_entry)
        .or_else(|| default_template(cmd))
        .unwrap_or(Template {
            command_override: None,
            command: json!({}),
        }))
}

fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Builds the outgoing command code and compact JSON payload for a request.
///
/// Identity fields (`gwId`/`devId`/`uid`) are taken from the device id,
/// `t` is the current epoch second (integer when the template marker is
/// `"int"`, decimal string otherwise), and `data` lands in `dps`, `dpId` or
/// the nested `data` object depending on the template shape.
pub fn generate_payload(
    device_id: &str,
    version: Version,
    dev_type: &str,
    command: CommandType,
    data: Option<Value>,
    cid: Option<&str>,
    req_type: Option<&str>,
) -> Result<(u32, Vec<u8>)> {
    let template = lookup(dev_type, version, command)?;
    let cmd = template.command_override.unwrap_or(command) as u32;

    let mut obj = match template.command {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    if obj.contains_key("gwId") {
        obj.insert("gwId".into(), device_id.into());
    }
    if obj.contains_key("devId") {
        obj.insert("devId".into(), cid.unwrap_or(device_id).into());
    }
    if obj.contains_key("uid") {
        obj.insert("uid".into(), device_id.into());
    }
    if obj.contains_key("cid") {
        let cid = cid.ok_or_else(|| {
            TuyaError::Configuration("zigbee commands require a cluster id".into())
        })?;
        obj.insert("cid".into(), cid.into());
    }
    if let Some(t) = obj.get("t") {
        let ts = timestamp_secs();
        let value = if t.as_str() == Some("int") {
            json!(ts)
        } else {
            json!(ts.to_string())
        };
        obj.insert("t".into(), value);
    }

    // Devices in the device22 profile answer a translated dp-query only when
    // a dps object is present; probe with a null data point.
    let data = match data {
        None if dev_type == DEV_TYPE_DEVICE22 && cmd == CommandType::ControlNew as u32 => {
            Some(json!({"1": null}))
        }
        other => other,
    };

    if let Some(d) = data {
        if obj.contains_key("dpId") {
            obj.insert("dpId".into(), d);
        } else if let Some(Value::Object(nested)) = obj.get_mut("data") {
            if let Some(c) = cid {
                nested.insert("cid".into(), c.into());
                nested.insert("ctype".into(), 0.into());
            }
            if command == CommandType::LanExtStream {
                if let Value::Object(extra) = d {
                    nested.extend(extra);
                }
            } else {
                nested.insert("dps".into(), d);
            }
        } else {
            obj.insert("dps".into(), d);
        }
    }

    if let Some(rt) = req_type {
        obj.insert("reqType".into(), rt.into());
    }

    // serde_json's compact form has no whitespace between tokens; devices
    // ignore requests that contain any.
    let bytes = serde_json::to_vec(&Value::Object(obj))?;
    Ok((cmd, bytes))
}
