use std::collections::HashMap;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::KeyValueType;

/// Reserved field 0: the whole document as CJSON, addressed by JSON path
/// lookups for everything that has no dedicated slot.
pub const TUPLE_FIELD: usize = 0;
pub const TUPLE_FIELD_NAME: &str = "-tuple";

/// One field of an item layout.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadField {
    pub name: String,
    pub key_type: KeyValueType,
    pub is_array: bool,
    pub offset: usize,
    pub json_paths: Vec<String>,
    /// Composite fields name two or more sibling fields and occupy no slot.
    pub subfields: Vec<String>,
}

impl PayloadField {
    /// Fixed slot width in the payload body. Strings and arrays store an
    /// (offset, len) pair pointing into the variable tail.
    pub fn slot_width(&self) -> usize {
        if self.is_array {
            return 8;
        }
        match self.key_type {
            KeyValueType::Int | KeyValueType::Int64 | KeyValueType::Double | KeyValueType::String => 8,
            KeyValueType::Bool => 1,
            KeyValueType::Uuid | KeyValueType::Point => 16,
            KeyValueType::Composite => 0,
            _ => 0,
        }
    }

    pub fn element_width(&self) -> usize {
        match self.key_type {
            KeyValueType::Bool => 1,
            KeyValueType::Uuid | KeyValueType::Point => 16,
            _ => 8,
        }
    }
}

#[derive(Debug)]
struct PayloadTypeImpl {
    name: String,
    fields: Vec<PayloadField>,
    by_name: HashMap<String, usize>,
    by_json_path: HashMap<String, usize>,
    fixed_size: usize,
}

/// Immutable description of an item layout, shared by any number of
/// payload values of the same namespace generation.
#[derive(Debug, Clone)]
pub struct PayloadType(Arc<PayloadTypeImpl>);

impl PayloadType {
    pub fn builder(name: impl Into<String>) -> PayloadTypeBuilder {
        PayloadTypeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn num_fields(&self) -> usize {
        self.0.fields.len()
    }

    pub fn field(&self, idx: usize) -> &PayloadField {
        &self.0.fields[idx]
    }

    pub fn fields(&self) -> &[PayloadField] {
        &self.0.fields
    }

    pub fn field_by_name(&self, name: &str) -> Option<usize> {
        self.0.by_name.get(name).copied()
    }

    pub fn field_by_json_path(&self, path: &str) -> Option<usize> {
        self.0.by_json_path.get(path).copied()
    }

    /// Size of the fixed slot region; variable data starts here.
    pub fn fixed_size(&self) -> usize {
        self.0.fixed_size
    }

    /// Addressable sub-structure of a field: its own slot for plain
    /// fields, the sub-field slots for composites, plus embedded JSON
    /// paths for anything without a slot.
    pub fn fields_set_of(&self, idx: usize) -> FieldsSet {
        let mut set = FieldsSet::new();
        let field = self.field(idx);
        if field.key_type == KeyValueType::Composite {
            for sub in &field.subfields {
                match self.field_by_name(sub) {
                    Some(sub_idx) => set.push_field(sub_idx),
                    None => set.push_json_path(sub.clone()),
                }
            }
        } else {
            set.push_field(idx);
            for path in &field.json_paths {
                if path != &field.name {
                    set.push_json_path(path.clone());
                }
            }
        }
        set
    }
}

impl PartialEq for PayloadType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.name == other.0.name && self.0.fields == other.0.fields)
    }
}

pub struct PayloadTypeBuilder {
    name: String,
    fields: Vec<PayloadField>,
}

impl PayloadTypeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        PayloadTypeBuilder {
            name: name.into(),
            fields: vec![PayloadField {
                name: TUPLE_FIELD_NAME.to_string(),
                key_type: KeyValueType::String,
                is_array: false,
                offset: 0,
                json_paths: Vec::new(),
                subfields: Vec::new(),
            }],
        }
    }

    pub fn field(self, name: impl Into<String>, key_type: KeyValueType, is_array: bool) -> Self {
        let name = name.into();
        let paths = vec![name.clone()];
        self.field_with_paths(name, key_type, is_array, paths)
    }

    pub fn field_with_paths(
        mut self,
        name: impl Into<String>,
        key_type: KeyValueType,
        is_array: bool,
        json_paths: Vec<String>,
    ) -> Self {
        self.fields.push(PayloadField {
            name: name.into(),
            key_type,
            is_array,
            offset: 0,
            json_paths,
            subfields: Vec::new(),
        });
        self
    }

    pub fn composite(mut self, name: impl Into<String>, subfields: Vec<String>) -> Self {
        self.fields.push(PayloadField {
            name: name.into(),
            key_type: KeyValueType::Composite,
            is_array: false,
            offset: 0,
            json_paths: Vec::new(),
            subfields,
        });
        self
    }

    pub fn build(mut self) -> Result<PayloadType> {
        let mut by_name = HashMap::new();
        let mut by_json_path = HashMap::new();
        let mut offset = 0usize;
        for (idx, field) in self.fields.iter_mut().enumerate() {
            if by_name.insert(field.name.clone(), idx).is_some() {
                return Err(Error::new(
                    ErrorKind::Conflict,
                    format!("duplicate field name '{}'", field.name),
                ));
            }
            for path in &field.json_paths {
                by_json_path.insert(path.clone(), idx);
            }
            field.offset = offset;
            offset += field.slot_width();
        }
        for field in &self.fields {
            if field.key_type == KeyValueType::Composite {
                if field.subfields.len() < 2 {
                    return Err(Error::new(
                        ErrorKind::Params,
                        format!("composite field '{}' must name at least 2 sub-fields", field.name),
                    ));
                }
                for sub in &field.subfields {
                    if !by_name.contains_key(sub.as_str()) {
                        return Err(Error::new(
                            ErrorKind::NotFound,
                            format!("composite field '{}' names unknown field '{}'", field.name, sub),
                        ));
                    }
                }
            }
        }
        Ok(PayloadType(Arc::new(PayloadTypeImpl {
            name: self.name,
            fields: self.fields,
            by_name,
            by_json_path,
            fixed_size: offset,
        })))
    }
}

/// Compact set of field indices plus embedded JSON paths for fields that
/// have no dedicated slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldsSet {
    fields: Vec<usize>,
    json_paths: Vec<String>,
}

impl FieldsSet {
    pub fn new() -> Self {
        FieldsSet::default()
    }

    pub fn from_field(idx: usize) -> Self {
        FieldsSet { fields: vec![idx], json_paths: Vec::new() }
    }

    pub fn push_field(&mut self, idx: usize) {
        if !self.fields.contains(&idx) {
            self.fields.push(idx);
        }
    }

    pub fn push_json_path(&mut self, path: impl Into<String>) {
        self.json_paths.push(path.into());
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.fields.contains(&idx)
    }

    pub fn fields(&self) -> &[usize] {
        &self.fields
    }

    pub fn json_paths(&self) -> &[String] {
        &self.json_paths
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.json_paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_slot_widths() {
        let t = PayloadType::builder("items")
            .field("id", KeyValueType::Int, false)
            .field("flag", KeyValueType::Bool, false)
            .field("name", KeyValueType::String, false)
            .build()
            .unwrap();
        // tuple slot (8) + id (8) + flag (1) + name (8)
        assert_eq!(t.field(1).offset, 8);
        assert_eq!(t.field(2).offset, 16);
        assert_eq!(t.field(3).offset, 17);
        assert_eq!(t.fixed_size(), 25);
        assert_eq!(t.field_by_name("name"), Some(3));
        assert_eq!(t.field_by_json_path("id"), Some(1));
    }

    #[test]
    fn composite_requires_two_subfields() {
        let err = PayloadType::builder("items")
            .field("a", KeyValueType::Int, false)
            .composite("c", vec!["a".to_string()])
            .build()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Params);
    }
}
