//! Fee structure model: the template a fee invoice is issued from.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Category of fee a structure bills for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeType {
    Tuition,
    Transport,
    Boarding,
    Exam,
    Other,
}

impl FeeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeType::Tuition => "tuition",
            FeeType::Transport => "transport",
            FeeType::Boarding => "boarding",
            FeeType::Exam => "exam",
            FeeType::Other => "other",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "tuition" => FeeType::Tuition,
            "transport" => FeeType::Transport,
            "boarding" => FeeType::Boarding,
            "exam" => FeeType::Exam,
            _ => FeeType::Other,
        }
    }
}

/// How often the fee recurs within an academic year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeFrequency {
    Once,
    Term,
    Annual,
}

impl FeeFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeFrequency::Once => "once",
            FeeFrequency::Term => "term",
            FeeFrequency::Annual => "annual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "term" => FeeFrequency::Term,
            "annual" => FeeFrequency::Annual,
            _ => FeeFrequency::Once,
        }
    }
}

/// A fee definition scoped to a school, class level and academic year.
///
/// Frozen against mutation once the first invoice is issued from it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FeeStructure {
    pub fee_structure_id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub fee_type: String,
    pub frequency: String,
    pub amount: Decimal,
    pub mandatory: bool,
    pub class_level: Option<String>,
    pub academic_year: String,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
    pub active: bool,
    pub issued: bool,
    pub created_utc: DateTime<Utc>,
}

impl FeeStructure {
    /// True when the structure may be billed on `today` for `academic_year`.
    pub fn is_billable(&self, academic_year: &str, today: NaiveDate) -> bool {
        self.active
            && self.academic_year == academic_year
            && self.valid_from <= today
            && self.valid_to.map_or(true, |until| today <= until)
    }
}

/// Input for creating a fee structure.
#[derive(Debug, Clone)]
pub struct CreateFeeStructure {
    pub school_id: Uuid,
    pub name: String,
    pub fee_type: FeeType,
    pub frequency: FeeFrequency,
    pub amount: Decimal,
    pub mandatory: bool,
    pub class_level: Option<String>,
    pub academic_year: String,
    pub valid_from: NaiveDate,
    pub valid_to: Option<NaiveDate>,
}
