//! Canonical message names.
//!
//! A descriptor is the `namespace:name` pair that identifies a message type on
//! the wire. It names the broker exchange a message is published to and is the
//! key used to resolve an inbound message back to a registered type.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Separator between namespace and name in the canonical form.
pub const DESCRIPTOR_SEPARATOR: char = ':';

/// Namespace used for types whose name carries no module path.
const GLOBAL_NAMESPACE: &str = "global";

/// Errors produced when parsing a descriptor string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorParseError {
    #[error("Descriptor '{0}' has no namespace separator")]
    MissingSeparator(String),

    #[error("Descriptor '{0}' has an empty namespace or name")]
    EmptySegment(String),

    #[error("Descriptor '{0}' has more than one namespace separator")]
    TooManySeparators(String),
}

/// Immutable `(namespace, name)` pair naming a message type.
///
/// Equality and hashing ignore ASCII case, so `Orders:PlaceOrder` and
/// `orders:placeorder` address the same exchange and resolve to the same type.
#[derive(Debug, Clone)]
pub struct MessageDescriptor {
    namespace: String,
    name: String,
}

impl MessageDescriptor {
    /// Create a descriptor from explicit parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the descriptor of a Rust type.
    ///
    /// The module path becomes the namespace (with `::` rewritten to `.`) and
    /// the last path segment becomes the name, so
    /// `shop::orders::PlaceOrder` maps to `shop.orders:PlaceOrder`.
    pub fn of<T: ?Sized>() -> Self {
        Self::from_type_name(std::any::type_name::<T>())
    }

    fn from_type_name(full_name: &str) -> Self {
        let (path, generics) = match full_name.find('<') {
            Some(index) => full_name.split_at(index),
            None => (full_name, ""),
        };

        let (namespace, name) = match path.rsplit_once("::") {
            Some((namespace, name)) => (namespace.replace("::", "."), name),
            None => (GLOBAL_NAMESPACE.to_string(), path),
        };

        let name = format!("{}{}", name, generics.replace("::", "."));
        Self::new(namespace, name)
    }

    /// Parse the canonical `namespace:name` form.
    ///
    /// Returns `None` for malformed input instead of failing loudly.
    pub fn try_parse(value: &str) -> Option<Self> {
        value.parse().ok()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, DESCRIPTOR_SEPARATOR, self.name)
    }
}

impl FromStr for MessageDescriptor {
    type Err = DescriptorParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = value
            .split_once(DESCRIPTOR_SEPARATOR)
            .ok_or_else(|| DescriptorParseError::MissingSeparator(value.to_string()))?;

        if name.contains(DESCRIPTOR_SEPARATOR) {
            return Err(DescriptorParseError::TooManySeparators(value.to_string()));
        }

        let (namespace, name) = (namespace.trim(), name.trim());
        if namespace.is_empty() || name.is_empty() {
            return Err(DescriptorParseError::EmptySegment(value.to_string()));
        }

        Ok(Self::new(namespace, name))
    }
}

impl PartialEq for MessageDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.namespace.eq_ignore_ascii_case(&other.namespace)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for MessageDescriptor {}

impl Hash for MessageDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.namespace.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(DESCRIPTOR_SEPARATOR as u8);
        for byte in self.name.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    mod shop {
        pub mod orders {
            pub struct PlaceOrder;
            pub struct Envelope<T>(pub T);
        }
    }

    #[test]
    fn test_descriptor_of_type_uses_module_path() {
        let descriptor = MessageDescriptor::of::<shop::orders::PlaceOrder>();

        assert!(descriptor.namespace().ends_with("shop.orders"));
        assert!(!descriptor.namespace().contains("::"));
        assert_eq!(descriptor.name(), "PlaceOrder");
    }

    #[test]
    fn test_descriptor_of_generic_type_keeps_single_separator() {
        let descriptor = MessageDescriptor::of::<shop::orders::Envelope<shop::orders::PlaceOrder>>();
        let text = descriptor.to_string();

        assert_eq!(text.matches(DESCRIPTOR_SEPARATOR).count(), 1);
        assert!(descriptor.name().starts_with("Envelope<"));
    }

    #[test]
    fn test_round_trip_through_string() {
        let descriptor = MessageDescriptor::of::<shop::orders::PlaceOrder>();

        let parsed = MessageDescriptor::try_parse(&descriptor.to_string());

        assert_eq!(parsed, Some(descriptor));
    }

    #[test]
    fn test_round_trip_generic_type() {
        let descriptor = MessageDescriptor::of::<shop::orders::Envelope<u32>>();

        assert_eq!(
            MessageDescriptor::try_parse(&descriptor.to_string()),
            Some(descriptor)
        );
    }

    #[test]
    fn test_display_canonical_form() {
        let descriptor = MessageDescriptor::new("Tests", "ThirdTestCommand");
        assert_eq!(descriptor.to_string(), "Tests:ThirdTestCommand");
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        assert_eq!(
            "shop.orders.PlaceOrder".parse::<MessageDescriptor>(),
            Err(DescriptorParseError::MissingSeparator(
                "shop.orders.PlaceOrder".to_string()
            ))
        );
        assert!(MessageDescriptor::try_parse("").is_none());
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(MessageDescriptor::try_parse(":PlaceOrder").is_none());
        assert!(MessageDescriptor::try_parse("shop.orders:").is_none());
        assert!(MessageDescriptor::try_parse("  :  ").is_none());
    }

    #[test]
    fn test_parse_rejects_rust_paths() {
        assert!(MessageDescriptor::try_parse("shop::orders::PlaceOrder").is_none());
    }

    #[test]
    fn test_equality_ignores_case() {
        let a = MessageDescriptor::new("Shop.Orders", "PlaceOrder");
        let b = MessageDescriptor::new("shop.orders", "PLACEORDER");

        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_different_names_are_not_equal() {
        assert_ne!(
            MessageDescriptor::new("shop", "PlaceOrder"),
            MessageDescriptor::new("shop", "CancelOrder")
        );
    }
}
