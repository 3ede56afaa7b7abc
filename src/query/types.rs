use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};

/// Logic operation binding a query entry to its predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    And = 0,
    Or = 1,
    Not = 2,
}

impl OpType {
    pub fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => OpType::And,
            1 => OpType::Or,
            2 => OpType::Not,
            other => return Err(Error::new(ErrorKind::ParseBin, format!("unknown op type {}", other))),
        })
    }
}

/// Condition of a filter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CondType {
    Any = 0,
    Eq = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
    Range = 6,
    Set = 7,
    AllSet = 8,
    Empty = 9,
    Like = 10,
    DWithin = 11,
}

impl CondType {
    pub fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => CondType::Any,
            1 => CondType::Eq,
            2 => CondType::Lt,
            3 => CondType::Le,
            4 => CondType::Gt,
            5 => CondType::Ge,
            6 => CondType::Range,
            7 => CondType::Set,
            8 => CondType::AllSet,
            9 => CondType::Empty,
            10 => CondType::Like,
            11 => CondType::DWithin,
            other => return Err(Error::new(ErrorKind::ParseBin, format!("unknown condition {}", other))),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            CondType::Any => "ANY",
            CondType::Eq => "=",
            CondType::Lt => "<",
            CondType::Le => "<=",
            CondType::Gt => ">",
            CondType::Ge => ">=",
            CondType::Range => "RANGE",
            CondType::Set => "IN",
            CondType::AllSet => "ALLSET",
            CondType::Empty => "EMPTY",
            CondType::Like => "LIKE",
            CondType::DWithin => "DWITHIN",
        }
    }
}

/// Kind of a joined subquery; `Merge` concatenates result sets instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    LeftJoin = 0,
    InnerJoin = 1,
    OrInnerJoin = 2,
    Merge = 3,
}

impl JoinType {
    pub fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => JoinType::LeftJoin,
            1 => JoinType::InnerJoin,
            2 => JoinType::OrInnerJoin,
            3 => JoinType::Merge,
            other => return Err(Error::new(ErrorKind::ParseBin, format!("unknown join type {}", other))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggType {
    Sum = 0,
    Avg = 1,
    Facet = 2,
    Min = 3,
    Max = 4,
    Distinct = 5,
}

impl AggType {
    pub fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => AggType::Sum,
            1 => AggType::Avg,
            2 => AggType::Facet,
            3 => AggType::Min,
            4 => AggType::Max,
            5 => AggType::Distinct,
            other => return Err(Error::new(ErrorKind::ParseBin, format!("unknown aggregation {}", other))),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            AggType::Sum => "sum",
            AggType::Avg => "avg",
            AggType::Facet => "facet",
            AggType::Min => "min",
            AggType::Max => "max",
            AggType::Distinct => "distinct",
        }
    }
}

/// Total-count calculation mode of a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalcTotalMode {
    NoTotal = 0,
    CachedTotal = 1,
    AccurateTotal = 2,
}

impl CalcTotalMode {
    pub fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => CalcTotalMode::NoTotal,
            1 => CalcTotalMode::CachedTotal,
            2 => CalcTotalMode::AccurateTotal,
            other => return Err(Error::new(ErrorKind::ParseBin, format!("unknown total mode {}", other))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrictMode {
    NotSet = 0,
    None = 1,
    Names = 2,
    Indexes = 3,
}

impl StrictMode {
    pub fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => StrictMode::NotSet,
            1 => StrictMode::None,
            2 => StrictMode::Names,
            3 => StrictMode::Indexes,
            other => return Err(Error::new(ErrorKind::ParseBin, format!("unknown strict mode {}", other))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Select = 0,
    Update = 1,
    Delete = 2,
    Truncate = 3,
}

/// How an update entry modifies its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldModifyMode {
    Set = 0,
    Drop = 1,
    SetJson = 2,
}

/// Item modification mode shared by item ops and transaction steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemModifyMode {
    Update = 0,
    Insert = 1,
    Upsert = 2,
    Delete = 3,
}

impl ItemModifyMode {
    pub fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => ItemModifyMode::Update,
            1 => ItemModifyMode::Insert,
            2 => ItemModifyMode::Upsert,
            3 => ItemModifyMode::Delete,
            other => return Err(Error::new(ErrorKind::ParseBin, format!("unknown modify mode {}", other))),
        })
    }
}

pub const DEFAULT_LIMIT: u32 = u32::MAX;
pub const DEFAULT_OFFSET: u32 = 0;

// Record tags of the binary query wire. The stream is a sequence of
// tagged records terminated by `End`; standalone join/merge queries
// follow the root after its `End`.
pub mod tag {
    pub const CONDITION: u64 = 0;
    pub const DISTINCT: u64 = 1;
    pub const SORT_INDEX: u64 = 2;
    pub const JOIN_ON: u64 = 3;
    pub const LIMIT: u64 = 4;
    pub const OFFSET: u64 = 5;
    pub const REQ_TOTAL: u64 = 6;
    pub const DEBUG_LEVEL: u64 = 7;
    pub const AGGREGATION: u64 = 8;
    pub const SELECT_FILTER: u64 = 9;
    pub const SELECT_FUNCTION: u64 = 10;
    pub const END: u64 = 11;
    pub const EXPLAIN: u64 = 12;
    pub const EQUAL_POSITION: u64 = 13;
    pub const UPDATE_FIELD: u64 = 14;
    pub const AGGREGATION_LIMIT: u64 = 15;
    pub const AGGREGATION_OFFSET: u64 = 16;
    pub const AGGREGATION_SORT: u64 = 17;
    pub const OPEN_BRACKET: u64 = 18;
    pub const CLOSE_BRACKET: u64 = 19;
    pub const JOIN_CONDITION: u64 = 20;
    pub const DROP_FIELD: u64 = 21;
    pub const UPDATE_OBJECT: u64 = 22;
    pub const WITH_RANK: u64 = 23;
    pub const STRICT_MODE: u64 = 24;
    pub const UPDATE_FIELD_V2: u64 = 25;
    pub const BETWEEN_FIELDS_CONDITION: u64 = 26;
    pub const ALWAYS_FALSE_CONDITION: u64 = 27;
}
