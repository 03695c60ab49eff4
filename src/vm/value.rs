//! Runtime values, their JSON boundary and their content hash.

use std::fmt;

use serde_json::{Map, Number};

use ark_bls12_381::Fr;
use ark_ff::Zero;

use crate::compiler::program::{Kind, ValueType, string_ref};
use crate::hash::{Digest, composite_hash};
use crate::lang::Width;

/// A value on the VM stack, in a local slot or in `this` memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Result of a function that returns nothing.
    Null,
    String(String),
    Boolean(bool),
    UInt(Width, u64),
    Array(Vec<Value>),
    /// Record with fields in declaration order.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Builds a value of type `ty` from JSON. Objects must carry exactly the
    /// declared fields; integers must fit their width.
    pub fn from_json(json: &serde_json::Value, ty: &ValueType) -> Result<Self, String> {
        match (ty, json) {
            (ValueType::String, serde_json::Value::String(s)) => Ok(Value::String(s.clone())),
            (ValueType::Boolean, serde_json::Value::Bool(b)) => Ok(Value::Boolean(*b)),
            (ValueType::UInt(width), serde_json::Value::Number(n)) => match n.as_u64() {
                Some(v) if width.fits(v) => Ok(Value::UInt(*width, v)),
                _ => Err(format!("{n} is not a valid {width}")),
            },
            (ValueType::Array(inner), serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| Value::from_json(item, inner))
                .collect::<Result<_, _>>()
                .map(Value::Array),
            (ValueType::Object(fields), serde_json::Value::Object(map)) => {
                if let Some(extra) = map.keys().find(|key| !fields.iter().any(|(f, _)| f == *key))
                {
                    return Err(format!("unexpected field `{extra}`"));
                }
                fields
                    .iter()
                    .map(|(name, field_ty)| {
                        let json = map
                            .get(name)
                            .ok_or_else(|| format!("missing field `{name}`"))?;
                        let value = Value::from_json(json, field_ty)
                            .map_err(|err| format!("field `{name}`: {err}"))?;
                        Ok((name.clone(), value))
                    })
                    .collect::<Result<_, String>>()
                    .map(Value::Object)
            }
            (ty, json) => Err(format!("expected {}, found {json}", describe(ty))),
        }
    }

    /// Checks that an already built value has the shape of `ty`.
    pub fn check(&self, ty: &ValueType) -> Result<(), String> {
        match (ty, self) {
            (ValueType::String, Value::String(_)) | (ValueType::Boolean, Value::Boolean(_)) => {
                Ok(())
            }
            (ValueType::UInt(expected), Value::UInt(width, v))
                if expected == width && width.fits(*v) =>
            {
                Ok(())
            }
            (ValueType::Array(inner), Value::Array(items)) => {
                items.iter().try_for_each(|item| item.check(inner))
            }
            (ValueType::Object(fields), Value::Object(values)) if fields.len() == values.len() => {
                fields
                    .iter()
                    .zip(values)
                    .try_for_each(|((name, field_ty), (key, value))| {
                        if name != key {
                            return Err(format!("expected field `{name}`, found `{key}`"));
                        }
                        value.check(field_ty)
                    })
            }
            (ty, value) => Err(format!("expected {}, found {}", describe(ty), value.kind())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::UInt(_, v) => serde_json::Value::Number(Number::from(*v)),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::String(_) => "string",
            Value::Boolean(_) => "boolean",
            Value::UInt(..) => "integer",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// The machine word standing for this value: scalars are their own
    /// word, composites the field hash of their items.
    pub fn content_ref(&self) -> Fr {
        match self {
            Value::Null => Fr::zero(),
            Value::Boolean(b) => Fr::from(*b),
            Value::UInt(_, v) => Fr::from(*v),
            Value::String(s) => string_ref(s),
            Value::Array(items) => {
                let refs: Vec<Fr> = items.iter().map(Value::content_ref).collect();
                composite_hash(Kind::Array.code(), &refs)
            }
            Value::Object(fields) => {
                let refs: Vec<Fr> = fields.iter().map(|(_, value)| value.content_ref()).collect();
                composite_hash(Kind::Object.code(), &refs)
            }
        }
    }

    /// [`Value::content_ref`] as a digest.
    pub fn content_hash(&self) -> Digest {
        Digest::from_field(self.content_ref())
    }

    /// The zero value of `ty`: empty strings and arrays, `false`, `0`, and
    /// records of defaults.
    pub fn default_of(ty: &ValueType) -> Self {
        match ty {
            ValueType::String => Value::String(String::new()),
            ValueType::Boolean => Value::Boolean(false),
            ValueType::UInt(width) => Value::UInt(*width, 0),
            ValueType::Array(_) => Value::Array(Vec::new()),
            ValueType::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), Value::default_of(ty)))
                    .collect(),
            ),
        }
    }
}

fn describe(ty: &ValueType) -> String {
    match ty {
        ValueType::String => "string".to_string(),
        ValueType::Boolean => "boolean".to_string(),
        ValueType::UInt(width) => width.to_string(),
        ValueType::Array(inner) => format!("{}[]", describe(inner)),
        ValueType::Object(_) => "object".to_string(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn country() -> ValueType {
        ValueType::Object(vec![
            ("id".to_string(), ValueType::String),
            ("name".to_string(), ValueType::String),
        ])
    }

    #[test]
    fn test_object_from_json_keeps_declaration_order() {
        let value = Value::from_json(&json!({"name": "USA", "id": "usa"}), &country()).unwrap();
        assert_eq!(
            value,
            Value::Object(vec![
                ("id".to_string(), Value::String("usa".to_string())),
                ("name".to_string(), Value::String("USA".to_string())),
            ])
        );
        assert_eq!(value.to_json(), json!({"id": "usa", "name": "USA"}));
    }

    #[test]
    fn test_shape_mismatches_are_rejected() {
        assert!(Value::from_json(&json!({"id": "usa"}), &country()).is_err());
        assert!(Value::from_json(&json!({"id": "usa", "name": "USA", "x": 1}), &country()).is_err());
        assert!(Value::from_json(&json!(256), &ValueType::UInt(Width::U8)).is_err());
        assert!(Value::from_json(&json!(-1), &ValueType::UInt(Width::U32)).is_err());
        assert!(Value::from_json(&json!("1"), &ValueType::UInt(Width::U32)).is_err());
        assert!(
            Value::from_json(&json!([1, "2"]), &ValueType::Array(Box::new(ValueType::UInt(Width::U32))))
                .is_err()
        );
    }

    #[test]
    fn test_check_matches_from_json() {
        let ty = ValueType::Array(Box::new(ValueType::UInt(Width::U16)));
        let value = Value::from_json(&json!([1, 2, 3]), &ty).unwrap();
        assert!(value.check(&ty).is_ok());
        assert!(value.check(&ValueType::Array(Box::new(ValueType::UInt(Width::U32)))).is_err());
    }

    #[test]
    fn test_content_hash() {
        let one = Value::UInt(Width::U32, 1).content_hash();
        assert_eq!(one.to_words(), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(one, Value::Boolean(true).content_hash());
        assert_eq!(
            Value::String("ab".into()).content_ref(),
            string_ref("ab")
        );
        assert_ne!(
            Value::Array(vec![]).content_hash(),
            Value::Object(vec![]).content_hash()
        );
        assert_ne!(
            Value::Array(vec![Value::String("ab".into())]).content_hash(),
            Value::Array(vec![Value::String("a".into()), Value::String("b".into())]).content_hash()
        );
    }

    #[test]
    fn test_default_of_nested_record() {
        let ty = ValueType::Object(vec![
            ("id".to_string(), ValueType::String),
            ("count".to_string(), ValueType::UInt(Width::U8)),
            ("tags".to_string(), ValueType::Array(Box::new(ValueType::String))),
            ("country".to_string(), country()),
        ]);
        let value = Value::default_of(&ty);
        assert!(value.check(&ty).is_ok());
        assert_eq!(
            value.to_json(),
            json!({"id": "", "count": 0, "tags": [], "country": {"id": "", "name": ""}})
        );
    }
}
