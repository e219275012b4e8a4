//! Property type tags.

/// Type tag of a property (wire value in parentheses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PropType {
    Timestamp = 1,
    Number = 4,
    Cardinality = 5,
    Uint8 = 6,
    Uint32 = 7,
    Boolean = 9,
    Enum = 10,
    String = 11,
    Text = 12,
    Reference = 13,
    References = 14,
    Alias = 18,
    Int8 = 20,
    Int16 = 21,
    Uint16 = 22,
    Int32 = 23,
    Binary = 25,
    Vector = 27,
    ColVec = 30,
}

impl PropType {
    /// Creates a PropType from its wire representation.
    pub fn from_u8(v: u8) -> Option<PropType> {
        match v {
            1 => Some(PropType::Timestamp),
            4 => Some(PropType::Number),
            5 => Some(PropType::Cardinality),
            6 => Some(PropType::Uint8),
            7 => Some(PropType::Uint32),
            9 => Some(PropType::Boolean),
            10 => Some(PropType::Enum),
            11 => Some(PropType::String),
            12 => Some(PropType::Text),
            13 => Some(PropType::Reference),
            14 => Some(PropType::References),
            18 => Some(PropType::Alias),
            20 => Some(PropType::Int8),
            21 => Some(PropType::Int16),
            22 => Some(PropType::Uint16),
            23 => Some(PropType::Int32),
            25 => Some(PropType::Binary),
            27 => Some(PropType::Vector),
            30 => Some(PropType::ColVec),
            _ => None,
        }
    }

    /// Fixed width of the numeric-like tags, `None` for everything else.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            PropType::Timestamp | PropType::Number => Some(8),
            PropType::Int32 | PropType::Uint32 => Some(4),
            PropType::Int16 | PropType::Uint16 => Some(2),
            PropType::Int8 | PropType::Uint8 | PropType::Boolean | PropType::Enum => Some(1),
            _ => None,
        }
    }

    /// Integer-valued tags (including timestamps).
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PropType::Timestamp
                | PropType::Int8
                | PropType::Uint8
                | PropType::Int16
                | PropType::Uint16
                | PropType::Int32
                | PropType::Uint32
        )
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self == PropType::Number
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            PropType::Timestamp | PropType::Int8 | PropType::Int16 | PropType::Int32
        )
    }

    pub fn is_reference(self) -> bool {
        matches!(self, PropType::Reference | PropType::References)
    }

    /// String-like tags that may be stored length-prefixed.
    pub fn is_string_like(self) -> bool {
        matches!(self, PropType::String | PropType::Alias | PropType::Text)
    }

    /// Tags that are never placed in the main block.
    pub fn always_separate(self) -> bool {
        matches!(
            self,
            PropType::Vector
                | PropType::ColVec
                | PropType::Text
                | PropType::Reference
                | PropType::References
                | PropType::Alias
                | PropType::Cardinality
        )
    }

    /// Inclusive integer range of the tag, if it is an integer.
    pub fn int_range(self) -> Option<(i64, i64)> {
        match self {
            PropType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            PropType::Uint8 => Some((0, u8::MAX as i64)),
            PropType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            PropType::Uint16 => Some((0, u16::MAX as i64)),
            PropType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            PropType::Uint32 => Some((0, u32::MAX as i64)),
            PropType::Timestamp => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip() {
        for v in 0..=255u8 {
            if let Some(t) = PropType::from_u8(v) {
                assert_eq!(t as u8, v);
            }
        }
        assert_eq!(PropType::from_u8(2), None);
    }

    #[test]
    fn test_widths() {
        assert_eq!(PropType::Number.fixed_width(), Some(8));
        assert_eq!(PropType::Uint16.fixed_width(), Some(2));
        assert_eq!(PropType::Enum.fixed_width(), Some(1));
        assert_eq!(PropType::String.fixed_width(), None);
    }
}
