//! GPU device request parsing.
//!
//! Accepts the syntax of the container runtime's `--gpus` flag: one CSV
//! record whose fields are `all`, a bare count, or `key=value` pairs. A field
//! containing commas must be double-quoted, e.g. `"device=1,3","driver=custom"`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub const DEFAULT_GPU_DRIVER: &str = "nvidia";

/// Capability list attached when the request does not name its own.
pub const DEFAULT_GPU_CAPABILITIES: [&str; 8] = [
    "nvidia", "compute", "compat32", "graphics", "utility", "video", "display", "gpu",
];

const GPU_CAPABILITY: &str = "gpu";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceSpecError {
    #[error("GPU request must not be empty")]
    Empty,
    #[error("malformed quoting in GPU request: {0}")]
    Quote(String),
    #[error("invalid count ({0}): expected an integer or 'all'")]
    InvalidCount(String),
    #[error("unexpected key '{key}' in '{field}'")]
    UnknownKey { key: String, field: String },
    #[error("GPU request key '{0}' can be specified only once")]
    DuplicateKey(String),
    #[error("GPU request 'device' needs at least one device id")]
    EmptyDevices,
    #[error("invalid GPU option '{0}', expected '<key>=<value>'")]
    InvalidOption(String),
    #[error("GPU request cannot combine a count ({0}) with explicit device ids")]
    CountWithDevices(i64),
}

/// Structured GPU allocation handed to the container runtime.
///
/// `count` is the number of devices (`-1` for all of them) and is `0` when
/// `device_ids` selects devices explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub driver: String,
    pub count: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,
    pub capabilities: Vec<Vec<String>>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl DeviceRequest {
    fn with_count(count: i64) -> Self {
        Self {
            driver: DEFAULT_GPU_DRIVER.to_owned(),
            count,
            device_ids: Vec::new(),
            capabilities: vec![default_capabilities()],
            options: BTreeMap::new(),
        }
    }

    /// Render the request back into `--gpus` syntax.
    pub fn to_cli_value(&self) -> String {
        let mut fields = Vec::new();
        if self.device_ids.is_empty() {
            if self.count < 0 {
                fields.push("all".to_owned());
            } else {
                fields.push(format!("count={}", self.count));
            }
        } else {
            fields.push(format!("device={}", self.device_ids.join(",")));
        }
        if !self.driver.is_empty() {
            fields.push(format!("driver={}", self.driver));
        }
        // The runtime appends "gpu" itself.
        let caps: Vec<&str> = self
            .capabilities
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|c| *c != GPU_CAPABILITY)
            .collect();
        if !caps.is_empty() {
            fields.push(format!("capabilities={}", caps.join(",")));
        }
        if !self.options.is_empty() {
            let opts: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            fields.push(format!("options={}", opts.join(",")));
        }
        fields
            .iter()
            .map(|f| quote_field(f))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn default_capabilities() -> Vec<String> {
    DEFAULT_GPU_CAPABILITIES
        .iter()
        .map(|c| (*c).to_owned())
        .collect()
}

/// The fixed request used when the caller asks for a number of GPUs rather
/// than supplying a spec string.
pub fn default_device_requests(count: i64) -> Vec<DeviceRequest> {
    vec![DeviceRequest::with_count(count)]
}

/// Parse a `--gpus` style specification into device requests.
pub fn parse_gpu_spec(value: &str) -> Result<Vec<DeviceRequest>, DeviceSpecError> {
    let fields = split_record(value.trim())?;
    if fields.is_empty() {
        return Err(DeviceSpecError::Empty);
    }

    let mut req = DeviceRequest::with_count(0);
    let mut seen = BTreeSet::new();
    let mut count_set = false;
    let mut capabilities: Option<Vec<String>> = None;

    for field in &fields {
        let Some((key, val)) = field.split_once('=') else {
            if count_set {
                return Err(DeviceSpecError::DuplicateKey("count".to_owned()));
            }
            req.count = parse_count(field)?;
            count_set = true;
            continue;
        };

        if !seen.insert(key.to_owned()) {
            return Err(DeviceSpecError::DuplicateKey(key.to_owned()));
        }

        match key {
            "driver" => req.driver = val.to_owned(),
            "count" => {
                if count_set {
                    return Err(DeviceSpecError::DuplicateKey("count".to_owned()));
                }
                req.count = parse_count(val)?;
                count_set = true;
            }
            "device" => {
                let ids: Vec<String> = val
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_owned)
                    .collect();
                if ids.is_empty() {
                    return Err(DeviceSpecError::EmptyDevices);
                }
                req.device_ids = ids;
            }
            "capabilities" => {
                let mut caps: Vec<String> = val
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_owned)
                    .collect();
                if !caps.iter().any(|c| c == GPU_CAPABILITY) {
                    caps.push(GPU_CAPABILITY.to_owned());
                }
                capabilities = Some(caps);
            }
            "options" => {
                for opt in val.split(',').filter(|o| !o.is_empty()) {
                    let (k, v) = opt
                        .split_once('=')
                        .ok_or_else(|| DeviceSpecError::InvalidOption(opt.to_owned()))?;
                    req.options.insert(k.to_owned(), v.to_owned());
                }
            }
            _ => {
                return Err(DeviceSpecError::UnknownKey {
                    key: key.to_owned(),
                    field: field.clone(),
                })
            }
        }
    }

    if !req.device_ids.is_empty() {
        if req.count != 0 {
            return Err(DeviceSpecError::CountWithDevices(req.count));
        }
    } else if !count_set {
        // Only driver/capabilities/options given: one device.
        req.count = 1;
    }

    if let Some(caps) = capabilities {
        req.capabilities = vec![caps];
    }

    Ok(vec![req])
}

fn parse_count(s: &str) -> Result<i64, DeviceSpecError> {
    if s == "all" {
        return Ok(-1);
    }
    let n: i64 = s
        .parse()
        .map_err(|_| DeviceSpecError::InvalidCount(s.to_owned()))?;
    if n < 0 {
        return Err(DeviceSpecError::InvalidCount(s.to_owned()));
    }
    Ok(n)
}

/// Split one CSV record. Quoted fields may contain commas, and `""` inside a
/// quoted field is a literal quote.
fn split_record(input: &str) -> Result<Vec<String>, DeviceSpecError> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    let mut fields = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        let mut field = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(c) => field.push(c),
                    None => {
                        return Err(DeviceSpecError::Quote(format!(
                            "unterminated quoted field in '{input}'"
                        )))
                    }
                }
            }
            match chars.next() {
                None => {
                    fields.push(field);
                    return Ok(fields);
                }
                Some(',') => fields.push(field),
                Some(c) => {
                    return Err(DeviceSpecError::Quote(format!(
                        "unexpected '{c}' after closing quote in '{input}'"
                    )))
                }
            }
        } else {
            loop {
                match chars.next() {
                    None => {
                        fields.push(field);
                        return Ok(fields);
                    }
                    Some(',') => break,
                    Some('"') => {
                        return Err(DeviceSpecError::Quote(format!(
                            "bare quote in unquoted field in '{input}'"
                        )))
                    }
                    Some(c) => field.push(c),
                }
            }
            fields.push(field);
        }
    }
}

fn quote_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}
