//! Message headers.
//!
//! Three namespaces share one header set on the wire but are kept apart here:
//!
//! - **control**: bus-level metadata (`CorrelationId`, `SentOn`, `RetryCount`),
//!   exposed unprefixed.
//! - **transport**: engine-specific values such as the broker delivery tag,
//!   exposed as `<Transport>:<key>` (e.g. `RabbitMq:DeliveryTag`).
//! - **user**: anything else, exposed unprefixed.
//!
//! Engines decide how each namespace is spelled on the wire; the bag only
//! guarantees that values never migrate between namespaces.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Separator between a transport name and its key in display form.
pub const TRANSPORT_SEPARATOR: char = ':';

/// Bus-level headers written by producers and read by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControlHeader {
    CorrelationId,
    SentOn,
    RetryCount,
}

impl ControlHeader {
    pub const ALL: [ControlHeader; 3] = [Self::CorrelationId, Self::SentOn, Self::RetryCount];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CorrelationId => "CorrelationId",
            Self::SentOn => "SentOn",
            Self::RetryCount => "RetryCount",
        }
    }
}

impl fmt::Display for ControlHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlHeader {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|header| header.as_str().eq_ignore_ascii_case(value))
            .ok_or(())
    }
}

/// Key of a transport-specific header.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportKey {
    pub transport: String,
    pub key: String,
}

impl TransportKey {
    pub fn new(transport: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.transport, TRANSPORT_SEPARATOR, self.key)
    }
}

/// Ordered header mapping with explicit control, transport and user namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag {
    control: BTreeMap<ControlHeader, String>,
    transport: BTreeMap<TransportKey, String>,
    user: BTreeMap<String, String>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Control namespace
    // ------------------------------------------------------------------

    pub fn control(&self, header: ControlHeader) -> Option<&str> {
        self.control.get(&header).map(String::as_str)
    }

    pub fn set_control(&mut self, header: ControlHeader, value: impl Into<String>) {
        self.control.insert(header, value.into());
    }

    pub fn remove_control(&mut self, header: ControlHeader) -> Option<String> {
        self.control.remove(&header)
    }

    pub fn control_headers(&self) -> impl Iterator<Item = (ControlHeader, &str)> {
        self.control.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.control(ControlHeader::CorrelationId)
    }

    pub fn sent_on(&self) -> Option<&str> {
        self.control(ControlHeader::SentOn)
    }

    /// Current retry count; absent or unparsable values count as zero.
    pub fn retry_count(&self) -> u32 {
        self.control(ControlHeader::RetryCount)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.set_control(ControlHeader::RetryCount, count.to_string());
    }

    // ------------------------------------------------------------------
    // Transport namespace
    // ------------------------------------------------------------------

    pub fn transport(&self, transport: &str, key: &str) -> Option<&str> {
        self.transport
            .get(&TransportKey::new(transport, key))
            .map(String::as_str)
    }

    pub fn set_transport(
        &mut self,
        transport: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.transport
            .insert(TransportKey::new(transport, key), value.into());
    }

    pub fn remove_transport(&mut self, transport: &str, key: &str) -> Option<String> {
        self.transport.remove(&TransportKey::new(transport, key))
    }

    pub fn transport_headers(&self) -> impl Iterator<Item = (&TransportKey, &str)> {
        self.transport.iter().map(|(k, v)| (k, v.as_str()))
    }

    // ------------------------------------------------------------------
    // User namespace
    // ------------------------------------------------------------------

    pub fn user(&self, key: &str) -> Option<&str> {
        self.user.get(key).map(String::as_str)
    }

    pub fn set_user(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user.insert(key.into(), value.into());
    }

    pub fn remove_user(&mut self, key: &str) -> Option<String> {
        self.user.remove(key)
    }

    pub fn user_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.user.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // ------------------------------------------------------------------
    // Display-key access
    // ------------------------------------------------------------------

    /// Look a header up by its display key.
    ///
    /// Control names win, then `<Transport>:<key>` transport entries, then user
    /// headers.
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Ok(header) = key.parse::<ControlHeader>() {
            if let Some(value) = self.control(header) {
                return Some(value);
            }
        }

        if let Some((transport, name)) = key.split_once(TRANSPORT_SEPARATOR) {
            if let Some(value) = self.transport(transport, name) {
                return Some(value);
            }
        }

        self.user(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// All headers as `(display key, value)` in control, transport, user order.
    pub fn iter(&self) -> impl Iterator<Item = (String, &str)> {
        let control = self
            .control
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.as_str()));
        let transport = self
            .transport
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_str()));
        let user = self.user.iter().map(|(k, v)| (k.clone(), v.as_str()));

        control.chain(transport).chain(user)
    }

    pub fn len(&self) -> usize {
        self.control.len() + self.transport.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
