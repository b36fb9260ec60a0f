//! Request arguments as an ordered, multi-valued name/value collection.
//!
//! Query string parameters, form fields and multipart text parts all land
//! here. A name repeated across sources accumulates into a multi-value,
//! preserving encounter order, which the flexible calling convention
//! depends on.

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Single(String),
    Multi(Vec<String>),
}

impl ArgValue {
    pub fn first(&self) -> &str {
        match self {
            ArgValue::Single(s) => s,
            ArgValue::Multi(v) => v.first().map(|s| s.as_str()).unwrap_or(""),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            ArgValue::Single(_) => 1,
            ArgValue::Multi(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgumentSet {
    entries: Vec<(String, ArgValue)>,
}

impl ArgumentSet {
    pub fn new() -> Self {
        ArgumentSet::default()
    }

    /// Append one value. A repeated name promotes the entry to an array,
    /// keeping the position of its first occurrence.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some((_, existing)) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            match existing {
                ArgValue::Single(prev) => {
                    *existing = ArgValue::Multi(vec![std::mem::take(prev), value]);
                }
                ArgValue::Multi(v) => v.push(value),
            }
        } else {
            self.entries.push((name, ArgValue::Single(value)));
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Case-insensitive lookup; catalog argument names come back in
    /// arbitrary case from different servers.
    pub fn get_ignore_case(&self, name: &str) -> Option<&ArgValue> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, ArgValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten into parallel name/value arrays: multi-valued arguments
    /// repeat the name once per value, in order.
    pub fn flattened(&self) -> (Vec<String>, Vec<String>) {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (name, value) in &self.entries {
            match value {
                ArgValue::Single(v) => {
                    names.push(name.clone());
                    values.push(v.clone());
                }
                ArgValue::Multi(vs) => {
                    for v in vs {
                        names.push(name.clone());
                        values.push(v.clone());
                    }
                }
            }
        }
        (names, values)
    }

    /// Parse a `k=v&k2=v2` encoded string (query string or form body)
    /// into this set. `+` means space; percent escapes are decoded.
    pub fn parse_urlencoded(&mut self, raw: &str) -> GatewayResult<()> {
        for pair in raw.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = match pair.split_once('=') {
                Some((n, v)) => (n, v),
                None => (pair, ""),
            };
            let name = decode_component(name)?;
            let value = decode_component(value)?;
            if name.is_empty() {
                continue;
            }
            self.push(name, value);
        }
        Ok(())
    }
}

fn decode_component(raw: &str) -> GatewayResult<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|c| c.into_owned())
        .map_err(|e| GatewayError::BadRequest(format!("malformed percent encoding: {}", e)))
}
