//! Opcode tables shared by the encoders, the decoder and the engine.

/// Write instruction opcodes.
pub mod modify {
    pub const SWITCH_TYPE: u8 = 0x01;
    pub const SWITCH_NODE: u8 = 0x02;
    pub const SWITCH_NODE_TMP: u8 = 0x03;
    pub const CREATE_NODE: u8 = 0x04;
    pub const SWITCH_FIELD: u8 = 0x05;
    pub const MAIN_FULL: u8 = 0x06;
    pub const MAIN_PARTIAL: u8 = 0x07;
    pub const UPDATE_FIELD: u8 = 0x08;
    pub const DELETE_FIELD: u8 = 0x09;
    pub const DELETE_NODE: u8 = 0x0A;
    pub const INCREMENT: u8 = 0x0B;
    pub const DECREMENT: u8 = 0x0C;
    pub const REF_SET: u8 = 0x0D;
    pub const REFS_SET: u8 = 0x0E;
    pub const REFS_ADD: u8 = 0x0F;
    pub const REFS_DELETE: u8 = 0x10;
    pub const DELETE_TEXT: u8 = 0x11;

    // Reference item flags
    pub const REF_TMP: u8 = 0x01;
    pub const REF_EDGES: u8 = 0x02;
    pub const REF_DEFERRED: u8 = 0x04;

    /// Bytes of a reference item before its optional edge block.
    pub const REF_ITEM_HEADER: usize = 5;
}

/// Query header.
pub mod query {
    pub const TARGET_ID: u8 = 0x01;
    pub const TARGET_IDS: u8 = 0x02;
    pub const TARGET_SCAN: u8 = 0x03;
    pub const TARGET_AGGREGATE: u8 = 0x04;

    pub const ORDER_ASC: u8 = 0;
    pub const ORDER_DESC: u8 = 1;
}

/// Filter byte-code.
pub mod filter {
    pub const COND: u8 = 0x01;
    pub const OR: u8 = 0x02;
    pub const REF: u8 = 0x03;
    pub const REFS: u8 = 0x04;
    pub const EDGE: u8 = 0x05;

    pub const EQUAL: u8 = 1;
    pub const EQUAL_BATCH_SMALL: u8 = 2;
    pub const EQUAL_BATCH_LARGE: u8 = 3;
    pub const EQUAL_ANY: u8 = 4;
    pub const GREATER: u8 = 5;
    pub const GREATER_EQ: u8 = 6;
    pub const LESS: u8 = 7;
    pub const LESS_EQ: u8 = 8;
    pub const RANGE: u8 = 9;
    pub const INCLUDES: u8 = 10;
    pub const EXISTS: u8 = 11;
    pub const NEGATE: u8 = 0x80;

    /// `[op][u32 jump][u32 right size]`
    pub const OR_HEADER: usize = 9;
    /// `[op][u8 cond][u8 slot][u8 type][u32 start][u16 width][u8 locale][u32 len]`
    pub const COND_HEADER: usize = 15;
}

/// Include descriptor.
pub mod include {
    pub const MAIN: u8 = 0x01;
    pub const FIELD: u8 = 0x02;
    pub const REF: u8 = 0x03;
    pub const REFS: u8 = 0x04;
    pub const EDGE: u8 = 0x05;
    pub const COUNT: u8 = 0x06;
}

/// Result buffer instructions.
pub mod result {
    pub const MAIN: u8 = 0x01;
    pub const FIELD: u8 = 0x02;
    pub const REF: u8 = 0x03;
    pub const REFS: u8 = 0x04;
    pub const EDGE: u8 = 0x05;
    pub const AGG: u8 = 0x06;
    pub const END: u8 = 0xFF;
}

/// Aggregate kinds.
pub mod aggregate {
    pub const COUNT: u8 = 1;
    pub const SUM: u8 = 2;
    pub const AVG: u8 = 3;
    pub const MIN: u8 = 4;
    pub const MAX: u8 = 5;
    pub const CARDINALITY: u8 = 6;
}

/// Separate payload compression flags.
pub mod compression {
    pub const NONE: u8 = 0;
    pub const ZSTD: u8 = 1;
}
