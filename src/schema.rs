use crate::types::{Document, VERSION_FIELD};
use std::collections::HashSet;

/// The schema facts the update path checks: whether a unique-key field is
/// declared, whether the version field exists, and which fields are stored
/// as doc-values only (the only fields an in-place update may touch).
#[derive(Debug, Clone)]
pub struct Schema {
    unique_key_field: Option<String>,
    has_version_field: bool,
    doc_values_only: HashSet<String>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn unique_key_field(&self) -> Option<&str> {
        self.unique_key_field.as_deref()
    }

    pub fn has_version_field(&self) -> bool {
        self.has_version_field
    }

    pub fn is_doc_values_only(&self, field: &str) -> bool {
        self.doc_values_only.contains(field)
    }

    /// An in-place update may only carry the unique key, the version field,
    /// and doc-values-only fields.
    pub fn supports_in_place(&self, doc: &Document) -> bool {
        doc.fields
            .keys()
            .all(|f| f == VERSION_FIELD || self.is_doc_values_only(f))
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    unique_key_field: Option<String>,
    has_version_field: bool,
    doc_values_only: HashSet<String>,
}

impl SchemaBuilder {
    pub fn unique_key(mut self, field: impl Into<String>) -> Self {
        self.unique_key_field = Some(field.into());
        self
    }

    pub fn version_field(mut self) -> Self {
        self.has_version_field = true;
        self
    }

    pub fn doc_values_only(mut self, field: impl Into<String>) -> Self {
        self.doc_values_only.insert(field.into());
        self
    }

    pub fn build(self) -> Schema {
        Schema {
            unique_key_field: self.unique_key_field,
            has_version_field: self.has_version_field,
            doc_values_only: self.doc_values_only,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    #[test]
    fn empty_schema_has_nothing() {
        let schema = Schema::builder().build();
        assert_eq!(schema.unique_key_field(), None);
        assert!(!schema.has_version_field());
    }

    #[test]
    fn full_schema() {
        let schema = Schema::builder()
            .unique_key("id")
            .version_field()
            .doc_values_only("popularity")
            .build();
        assert_eq!(schema.unique_key_field(), Some("id"));
        assert!(schema.has_version_field());
        assert!(schema.is_doc_values_only("popularity"));
        assert!(!schema.is_doc_values_only("title"));
    }

    #[test]
    fn in_place_support_checks_fields() {
        let schema = Schema::builder()
            .unique_key("id")
            .version_field()
            .doc_values_only("popularity")
            .build();

        let mut ok = Document::new("A").with_field("popularity", FieldValue::Integer(3));
        ok.set_version(10);
        assert!(schema.supports_in_place(&ok));

        let bad = Document::new("A").with_field("title", FieldValue::Text("x".into()));
        assert!(!schema.supports_in_place(&bad));
    }
}
