//! Connection option multimap
//!
//! Options arrive from the connection URL query (`?so-reuse=false`) and from
//! the driver itself. A key may carry several values; most consumers only look
//! at the first one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// BACnet/IP well-known UDP port (0xBAC0)
pub const BACNET_UDP_DEFAULT_PORT: u16 = 47808;

/// Port used when the connection URL does not name one
pub const OPTION_DEFAULT_UDP_PORT: &str = "default-udp-port";

/// Whether codec sockets are bound with SO_REUSEADDR / SO_REUSEPORT
pub const OPTION_SO_REUSE: &str = "so-reuse";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("option {key} has invalid value {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOptions {
    entries: BTreeMap<String, Vec<String>>,
}

impl DriverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a URL query string (`a=1&b=2&a=3`). Keys without `=` get an empty value.
    /// Keys and values are percent-decoded and `+` reads as a space.
    pub fn from_query(query: &str) -> Self {
        let mut options = Self::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            options.append(unescape(key), unescape(value));
        }
        options
    }

    /// Replace all values of `key` with a single value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), vec![value.into()]);
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    /// Insert only when the key is absent. Returns true if the value was inserted.
    pub fn insert_default(&mut self, key: &str, value: impl Into<String>) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.insert(key, value);
        true
    }

    /// Copy every entry of `other` whose key is not yet present
    pub fn merge_missing(&mut self, other: &DriverOptions) {
        for (key, values) in &other.entries {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| values.clone());
        }
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn all(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parse the first value of `key`. `Ok(None)` when the key is absent.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, OptionError> {
        match self.first(key) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| OptionError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Boolean flag; accepts true/false, yes/no, on/off, 1/0
    pub fn flag(&self, key: &str) -> Result<Option<bool>, OptionError> {
        let Some(value) = self.first(key) else {
            return Ok(None);
        };
        match value.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(OptionError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Decode `%XX` escapes and `+`. Malformed escapes are kept as written.
fn unescape(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| std::str::from_utf8(h).ok());
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn escape(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            write!(f, "{}", byte as char)?;
        } else {
            write!(f, "%{:02X}", byte)?;
        }
    }
    Ok(())
}

impl fmt::Display for DriverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, values) in &self.entries {
            for value in values {
                if !first {
                    f.write_str("&")?;
                }
                escape(f, key)?;
                f.write_str("=")?;
                escape(f, value)?;
                first = false;
            }
        }
        Ok(())
    }
}
