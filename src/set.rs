//! An ordered collection of key/value string fields.
//!
//! Unlike a map, a `Set` preserves insertion order and allows duplicate
//! keys. Request and response headers are stored this way (a request may
//! carry several `cookie:` fields), and the JSON flattener uses one as its
//! output sink.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Set {
    name: String,
    fields: Vec<Field>,
}

impl Set {
    pub fn new(name: impl Into<String>) -> Self {
        Set {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Index of the most recently appended field.
    pub fn last(&self) -> Option<usize> {
        self.fields.len().checked_sub(1)
    }

    /// Appends a field and returns its index. Duplicate keys are kept.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> usize {
        self.fields.push(Field {
            key: key.into(),
            value: value.into(),
        });
        self.fields.len() - 1
    }

    pub fn key(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(|f| f.key.as_str())
    }

    pub fn value(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(|f| f.value.as_str())
    }

    /// Replaces the value of the field at `idx`.
    pub fn set_value(&mut self, idx: usize, value: impl Into<String>) {
        if let Some(field) = self.fields.get_mut(idx) {
            field.value = value.into();
        }
    }

    /// Rewrites the key of the field at `idx` in place.
    pub fn set_key(&mut self, idx: usize, key: impl Into<String>) {
        if let Some(field) = self.fields.get_mut(idx) {
            field.key = key.into();
        }
    }

    /// First value whose key matches exactly.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    /// First value whose key matches ASCII case-insensitively.
    pub fn iget(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.key.eq_ignore_ascii_case(key))
            .map(|f| f.value.as_str())
    }

    /// Index of the first field whose key matches case-insensitively,
    /// starting the scan at `from`.
    pub fn ifind_from(&self, key: &str, from: usize) -> Option<usize> {
        self.fields
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, f)| f.key.eq_ignore_ascii_case(key))
            .map(|(i, _)| i)
    }

    pub fn delete(&mut self, idx: usize) {
        if idx < self.fields.len() {
            self.fields.remove(idx);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}
