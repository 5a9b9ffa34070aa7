//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. Two
/// `EmailAddress` values holding the same normalized string are the same
/// recipient, regardless of how the operator originally typed them.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
