use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum SinkCfg {
    Relational(RelationalSinkCfg),
    Analytics(AnalyticsSinkCfg),
    LogWorkspace(LogWorkspaceSinkCfg),
}

impl SinkCfg {
    pub fn id(&self) -> &str {
        match self {
            SinkCfg::Relational(c) => &c.id,
            SinkCfg::Analytics(c) => &c.id,
            SinkCfg::LogWorkspace(c) => &c.id,
        }
    }

    pub fn is_disabled(&self) -> bool {
        match self {
            SinkCfg::Relational(c) => c.disabled,
            SinkCfg::Analytics(c) => c.disabled,
            SinkCfg::LogWorkspace(c) => c.disabled,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SinkCfg::Relational(_) => "relational",
            SinkCfg::Analytics(_) => "analytics",
            SinkCfg::LogWorkspace(_) => "log_workspace",
        }
    }
}

/// Relational sink backed by a SQLite database file.
///
/// # Example
///
/// ```yaml
/// sinks:
///   - type: relational
///     config:
///       id: sql
///       path: ${DATA_DIR}/orders.db
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationalSinkCfg {
    pub id: String,

    /// Database file. `:memory:` opens a private in-memory database.
    pub path: String,

    #[serde(default)]
    pub disabled: bool,
}

/// Columnar analytics store.
///
/// # Example
///
/// ```yaml
/// sinks:
///   - type: analytics
///     config:
///       id: adx
///       database: telemetry
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsSinkCfg {
    pub id: String,

    /// Target database name, reported in logs.
    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub disabled: bool,
}

/// Log-workspace store with per-table ingestion rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogWorkspaceSinkCfg {
    pub id: String,

    /// Workspace identifier, reported in logs.
    #[serde(default)]
    pub workspace: Option<String>,

    #[serde(default)]
    pub disabled: bool,
}
