//! Declarative schema input.
//!
//! # Example
//!
//! ```rust
//! use schema_codec::schema::{PropDecl, SchemaDecl, TypeDecl};
//!
//! let decl = SchemaDecl::new()
//!     .locale("en")
//!     .type_decl("user", TypeDecl::new()
//!         .prop("name", PropDecl::string())
//!         .prop("age", PropDecl::uint8())
//!         .prop("bestFriend", PropDecl::reference("user")));
//! assert_eq!(decl.types.len(), 1);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::model::Value;
use crate::schema::PropType;

/// Caller-supplied validation hook, run after the built-in type checks.
#[derive(Clone)]
pub struct CustomValidator(pub Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>);

impl CustomValidator {
    pub fn new(f: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn check(&self, value: &Value) -> Result<(), String> {
        (self.0)(value)
    }
}

impl fmt::Debug for CustomValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomValidator")
    }
}

impl PartialEq for CustomValidator {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A locale enabled in the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleDecl {
    pub code: String,
    pub fallback: Vec<String>,
    pub required: bool,
}

/// A complete schema declaration.
#[derive(Debug, Clone, Default)]
pub struct SchemaDecl {
    pub locales: Vec<LocaleDecl>,
    pub types: Vec<(String, TypeDecl)>,
}

impl SchemaDecl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables a locale without fallbacks.
    pub fn locale(mut self, code: impl Into<String>) -> Self {
        self.locales.push(LocaleDecl {
            code: code.into(),
            fallback: Vec::new(),
            required: false,
        });
        self
    }

    /// Enables a locale that falls back to others in order.
    pub fn locale_with_fallback<I, S>(mut self, code: impl Into<String>, fallback: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locales.push(LocaleDecl {
            code: code.into(),
            fallback: fallback.into_iter().map(Into::into).collect(),
            required: false,
        });
        self
    }

    pub fn type_decl(mut self, name: impl Into<String>, decl: TypeDecl) -> Self {
        self.types.push((name.into(), decl));
        self
    }
}

/// Properties of one type, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TypeDecl {
    pub props: Vec<(String, PropDecl)>,
}

impl TypeDecl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property. Dotted names declare nested paths.
    pub fn prop(mut self, name: impl Into<String>, decl: PropDecl) -> Self {
        self.props.push((name.into(), decl));
        self
    }
}

/// Shape of a declared property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropKind {
    Leaf(PropType),
    Object(Vec<(String, PropDecl)>),
}

/// One declared property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropDecl {
    pub kind: PropKind,
    /// Target type of a reference.
    pub reference: Option<String>,
    /// Name of the reciprocal property on the target type.
    pub inverse: Option<String>,
    /// Properties stored on the reference itself.
    pub edges: Vec<(String, PropDecl)>,
    pub enum_values: Vec<String>,
    pub max_bytes: Option<usize>,
    pub dims: Option<usize>,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub validator: Option<CustomValidator>,
}

impl PropDecl {
    pub fn leaf(prop_type: PropType) -> Self {
        Self {
            kind: PropKind::Leaf(prop_type),
            reference: None,
            inverse: None,
            edges: Vec::new(),
            enum_values: Vec::new(),
            max_bytes: None,
            dims: None,
            default: None,
            min: None,
            max: None,
            validator: None,
        }
    }

    pub fn object(props: Vec<(String, PropDecl)>) -> Self {
        Self {
            kind: PropKind::Object(props),
            ..Self::leaf(PropType::Boolean)
        }
    }

    pub fn timestamp() -> Self {
        Self::leaf(PropType::Timestamp)
    }

    pub fn number() -> Self {
        Self::leaf(PropType::Number)
    }

    pub fn int8() -> Self {
        Self::leaf(PropType::Int8)
    }

    pub fn uint8() -> Self {
        Self::leaf(PropType::Uint8)
    }

    pub fn int16() -> Self {
        Self::leaf(PropType::Int16)
    }

    pub fn uint16() -> Self {
        Self::leaf(PropType::Uint16)
    }

    pub fn int32() -> Self {
        Self::leaf(PropType::Int32)
    }

    pub fn uint32() -> Self {
        Self::leaf(PropType::Uint32)
    }

    pub fn boolean() -> Self {
        Self::leaf(PropType::Boolean)
    }

    pub fn string() -> Self {
        Self::leaf(PropType::String)
    }

    pub fn text() -> Self {
        Self::leaf(PropType::Text)
    }

    pub fn binary() -> Self {
        Self::leaf(PropType::Binary)
    }

    pub fn alias() -> Self {
        Self::leaf(PropType::Alias)
    }

    pub fn cardinality() -> Self {
        Self::leaf(PropType::Cardinality)
    }

    pub fn vector(dims: usize) -> Self {
        Self {
            dims: Some(dims),
            ..Self::leaf(PropType::Vector)
        }
    }

    pub fn colvec(dims: usize) -> Self {
        Self {
            dims: Some(dims),
            ..Self::leaf(PropType::ColVec)
        }
    }

    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enum_values: values.into_iter().map(Into::into).collect(),
            ..Self::leaf(PropType::Enum)
        }
    }

    pub fn reference(target: impl Into<String>) -> Self {
        Self {
            reference: Some(target.into()),
            ..Self::leaf(PropType::Reference)
        }
    }

    pub fn references(target: impl Into<String>) -> Self {
        Self {
            reference: Some(target.into()),
            ..Self::leaf(PropType::References)
        }
    }

    pub fn inverse(mut self, prop: impl Into<String>) -> Self {
        self.inverse = Some(prop.into());
        self
    }

    pub fn edge(mut self, name: impl Into<String>, decl: PropDecl) -> Self {
        self.edges.push((name.into(), decl));
        self
    }

    pub fn max_bytes(mut self, max: usize) -> Self {
        self.max_bytes = Some(max);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn validator(mut self, validator: CustomValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}
