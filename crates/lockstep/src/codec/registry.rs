use std::collections::{BTreeMap, BTreeSet};

use super::{CodecError, WireObject, WireValue};
use crate::command::Command;
use crate::entity::EntityId;
use crate::stream::TickEnd;

/// Explicit serializable-field declaration for one object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    pub type_name: String,
    pub fields: Vec<String>,
}

impl TypeSchema {
    pub fn new<I, S>(type_name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            type_name: type_name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Host types that travel through the codec as `WireValue::Object`.
///
/// `to_fields` must return one value per entry of `FIELDS`, in order.
pub trait WireEncodable: Sized {
    const TYPE_NAME: &'static str;
    const FIELDS: &'static [&'static str];

    fn to_fields(&self) -> Vec<WireValue>;

    fn from_fields(fields: Vec<WireValue>) -> Result<Self, CodecError>;

    fn schema() -> TypeSchema {
        TypeSchema::new(Self::TYPE_NAME, Self::FIELDS.iter().copied())
    }

    fn to_wire(&self) -> WireValue {
        let fields = Self::FIELDS
            .iter()
            .map(|name| (*name).to_string())
            .zip(self.to_fields())
            .collect();
        WireValue::Object(WireObject {
            type_name: Self::TYPE_NAME.to_string(),
            fields,
        })
    }

    fn from_wire(value: WireValue) -> Result<Self, CodecError> {
        let object = match value {
            WireValue::Object(object) if object.type_name == Self::TYPE_NAME => object,
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: Self::TYPE_NAME,
                    found: describe(&other),
                })
            }
        };
        let names_match = object.fields.len() == Self::FIELDS.len()
            && object
                .fields
                .iter()
                .zip(Self::FIELDS)
                .all(|((name, _), declared)| name == declared);
        if !names_match {
            return Err(CodecError::TypeMismatch {
                expected: Self::TYPE_NAME,
                found: format!("{} with fields differing from declaration", object.type_name),
            });
        }
        Self::from_fields(object.fields.into_iter().map(|(_, value)| value).collect())
    }
}

fn describe(value: &WireValue) -> String {
    match value {
        WireValue::Object(object) => format!("object {}", object.type_name),
        other => other.kind().to_string(),
    }
}

/// Object types known to an encoder/decoder pair. Both sides must hold the
/// same (or a compatible) registry for object values to resolve.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    schemas: BTreeMap<String, TypeSchema>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the types a command stream carries.
    pub fn with_core_types() -> Self {
        let mut registry = Self::new();
        for schema in [EntityId::schema(), Command::schema(), TickEnd::schema()] {
            registry.schemas.insert(schema.type_name.clone(), schema);
        }
        registry
    }

    pub fn register_schema(&mut self, schema: TypeSchema) -> Result<(), CodecError> {
        if self.schemas.contains_key(&schema.type_name) {
            return Err(CodecError::DuplicateType {
                type_name: schema.type_name,
            });
        }
        let mut seen = BTreeSet::new();
        if let Some(repeated) = schema.fields.iter().find(|field| !seen.insert(field.as_str())) {
            return Err(CodecError::DuplicateField {
                type_name: schema.type_name.clone(),
                field: repeated.clone(),
            });
        }
        self.schemas.insert(schema.type_name.clone(), schema);
        Ok(())
    }

    pub fn register<T: WireEncodable>(&mut self) -> Result<(), CodecError> {
        self.register_schema(T::schema())
    }

    pub fn schema(&self, type_name: &str) -> Option<&TypeSchema> {
        self.schemas.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.schemas.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

pub(crate) fn expect_int(
    value: &WireValue,
    type_name: &'static str,
    field: &'static str,
) -> Result<i64, CodecError> {
    value.as_int().ok_or_else(|| CodecError::FieldType {
        type_name,
        field,
        expected: "int",
        found: value.kind(),
    })
}
