// =============================================================================
// Position domain model — snapshots and externally-initiated operations
// =============================================================================

pub mod diff_engine;

use serde::{Deserialize, Serialize};

/// Last known exchange position for one `(user_id, symbol)` pair.  This map
/// is the source of truth for "what did the exchange last tell us"; deriving
/// an external operation requires at least one prior snapshot, except for
/// `external_open`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub user_id: String,
    pub symbol: String,
    /// Signed size: positive long, negative short.
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    /// Exchange-side update time, milliseconds since the UNIX epoch.
    pub exchange_update_time: i64,
    /// When this snapshot was taken locally.
    pub snapshot_time: i64,
}

/// Classification of a position change attributable to an action taken
/// outside this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalOpKind {
    ExternalOpen,
    ExternalPartialClose,
    ExternalFullClose,
    ExternalAddPosition,
    ExternalCancel,
    ExternalModifyIncrease,
    ExternalModifyDecrease,
    ExternalOrderDeleted,
}

impl ExternalOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalOpen => "external_open",
            Self::ExternalPartialClose => "external_partial_close",
            Self::ExternalFullClose => "external_full_close",
            Self::ExternalAddPosition => "external_add_position",
            Self::ExternalCancel => "external_cancel",
            Self::ExternalModifyIncrease => "external_modify_increase",
            Self::ExternalModifyDecrease => "external_modify_decrease",
            Self::ExternalOrderDeleted => "external_order_deleted",
        }
    }

    /// Whether this kind represents some form of position close.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::ExternalPartialClose | Self::ExternalFullClose)
    }
}

impl std::fmt::Display for ExternalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExternalOpKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_open" => Ok(Self::ExternalOpen),
            "external_partial_close" => Ok(Self::ExternalPartialClose),
            "external_full_close" => Ok(Self::ExternalFullClose),
            "external_add_position" => Ok(Self::ExternalAddPosition),
            "external_cancel" => Ok(Self::ExternalCancel),
            "external_modify_increase" => Ok(Self::ExternalModifyIncrease),
            "external_modify_decrease" => Ok(Self::ExternalModifyDecrease),
            "external_order_deleted" => Ok(Self::ExternalOrderDeleted),
            other => anyhow::bail!("unknown external operation type: {other}"),
        }
    }
}

/// Processing state of a detected external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalOpStatus {
    Detected,
    Processed,
}

impl ExternalOpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Processed => "processed",
        }
    }
}

impl std::str::FromStr for ExternalOpStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(Self::Detected),
            "processed" => Ok(Self::Processed),
            other => anyhow::bail!("unknown external operation status: {other}"),
        }
    }
}

/// A materialised externally-initiated position change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalOperation {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub operation_type: ExternalOpKind,
    pub old_amount: f64,
    pub new_amount: f64,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
    pub detected_at: i64,
    pub status: ExternalOpStatus,
}
