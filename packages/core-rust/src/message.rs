//! Messages and their headers.
//!
//! A [`Message`] is a body plus an insertion-ordered set of [`Headers`]. The body
//! is reference counted: cloning a message (as fan-out constructs do when they
//! copy an exchange) shares the body until one side mutates it through
//! [`Message::body_mut`], at which point the writer gets its own copy.

use std::sync::Arc;

use crate::types::Value;

/// Insertion-ordered mapping from header name to value.
///
/// Replacing an existing header keeps its original position. Header counts are
/// small in practice, so lookups are linear.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, Value)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Inserts or replaces a header, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(key, _)| *key == name) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((name, value));
        None
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(key, _)| key == name)?;
        Some(self.entries.remove(index).1)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A message: body plus headers.
#[derive(Debug, Clone, Default)]
pub struct Message {
    body: Arc<Value>,
    headers: Headers,
}

impl Message {
    #[must_use]
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: Arc::new(body.into()),
            headers: Headers::new(),
        }
    }

    /// Builder-style header setter.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = Arc::new(body.into());
    }

    /// Mutable access to the body. Copies the body first if it is shared with
    /// another message.
    pub fn body_mut(&mut self) -> &mut Value {
        Arc::make_mut(&mut self.body)
    }

    /// Returns `true` if both messages point at the same body allocation.
    #[must_use]
    pub fn shares_body_with(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.headers.remove(name)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body && self.headers == other.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_keep_insertion_order() {
        let mut headers = Headers::new();
        headers.insert("z", 1);
        headers.insert("a", 2);
        headers.insert("m", 3);
        let names: Vec<&str> = headers.names().collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn replacing_header_keeps_position() {
        let mut headers: Headers = [("first", 1), ("second", 2)].into_iter().collect();
        let previous = headers.insert("first", 10);
        assert_eq!(previous, Some(Value::Int(1)));
        let entries: Vec<(&str, &Value)> = headers.iter().collect();
        assert_eq!(entries[0], ("first", &Value::Int(10)));
        assert_eq!(entries[1], ("second", &Value::Int(2)));
    }

    #[test]
    fn remove_header() {
        let mut headers: Headers = [("a", 1)].into_iter().collect();
        assert_eq!(headers.remove("a"), Some(Value::Int(1)));
        assert!(headers.remove("a").is_none());
        assert!(headers.is_empty());
    }

    #[test]
    fn cloned_message_shares_body_until_written() {
        let original = Message::new("payload");
        let mut copy = original.clone();
        assert!(copy.shares_body_with(&original));

        if let Value::String(s) = copy.body_mut() {
            s.push_str("-changed");
        }
        assert!(!copy.shares_body_with(&original));
        assert_eq!(original.body(), &Value::from("payload"));
        assert_eq!(copy.body(), &Value::from("payload-changed"));
    }

    #[test]
    fn cloned_message_headers_are_independent() {
        let original = Message::new(1).with_header("h", "v");
        let mut copy = original.clone();
        copy.set_header("h", "other");
        assert_eq!(original.header("h"), Some(&Value::from("v")));
        assert_eq!(copy.header("h"), Some(&Value::from("other")));
    }
}
