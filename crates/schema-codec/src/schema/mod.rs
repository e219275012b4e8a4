//! Schema declarations and their compiled layouts.

pub mod decl;
pub mod layout;
pub mod locale;
pub mod types;

pub use decl::{CustomValidator, LocaleDecl, PropDecl, PropKind, SchemaDecl, TypeDecl};
pub use layout::{
    compile, default_slot_priority, Location, PathNode, PropertyDef, RefTarget, SchemaLayout,
    SchemaOptions, TypeLayout,
};
pub use locale::{locale_code, locale_id, Locale, NO_LOCALE};
pub use types::PropType;
