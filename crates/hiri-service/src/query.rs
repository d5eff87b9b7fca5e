//! Request validation and cache reads behind the query endpoints.
//!
//! Handlers deserialize raw query strings into the `*Params` structs (every
//! field optional and textual) and call the `validate` methods, so a bad
//! parameter is always reported as a 400 with a readable message before the
//! store is touched. The read functions are synchronous and meant to run on
//! the blocking pool.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use hiri_store::{DayStore, Order};
use hiri_types::{Day, PartitionKey, Reading, Timestamp, validate_component};

use crate::config::{DefaultsConfig, MAX_LOG_TAIL};

/// Largest accepted `limite`.
pub const MAX_LIMIT: usize = 5000;
/// `limite` when none is given.
pub const DEFAULT_LIMIT: usize = 500;
/// `tail` when none is given.
pub const DEFAULT_TAIL: usize = 200;

/// A rejected query parameter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid '{field}': {message}")]
pub struct QueryError {
    pub field: &'static str,
    pub message: String,
}

impl QueryError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

/// Which rows a request wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    /// Only rows with a position and a PM2.5 value.
    #[default]
    Plotted,
    /// Every stored row.
    Raw,
}

impl RowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plotted => "plotted",
            Self::Raw => "raw",
        }
    }

    fn apply(self, rows: &mut Vec<Reading>) {
        if self == Self::Plotted {
            rows.retain(Reading::is_plottable);
        }
    }
}

impl FromStr for RowKind {
    type Err = QueryError;

    fn from_str(s: &str) -> QueryResult<Self> {
        match s {
            "plotted" => Ok(Self::Plotted),
            "raw" => Ok(Self::Raw),
            other => Err(QueryError::new(
                "type",
                format!("'{other}' is not one of 'plotted', 'raw'"),
            )),
        }
    }
}

/// What a read covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// A single partition.
    Device(PartitionKey),
    /// Every cached device of a project and tabla.
    AllDevices { project_id: String, tabla: String },
}

impl Scope {
    fn keys(&self, store: &DayStore) -> hiri_store::Result<Vec<PartitionKey>> {
        match self {
            Self::Device(key) => Ok(vec![key.clone()]),
            Self::AllDevices { project_id, tabla } => Ok(store
                .list_devices(project_id, tabla)?
                .into_iter()
                .filter_map(|device| PartitionKey::new(project_id, device, tabla).ok())
                .collect()),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::AllDevices { .. })
    }
}

/// Partition selection shared by every endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartitionParams {
    pub project_id: Option<String>,
    pub device_code: Option<String>,
    pub tabla: Option<String>,
}

impl PartitionParams {
    /// One partition; missing components come from `defaults`.
    pub fn key(&self, defaults: &DefaultsConfig) -> QueryResult<PartitionKey> {
        let project_id = component("project_id", &self.project_id, &defaults.project_id)?;
        let device_code = component("device_code", &self.device_code, &defaults.device_code)?;
        let tabla = component("tabla", &self.tabla, &defaults.tabla)?;
        Ok(PartitionKey {
            project_id,
            device_code,
            tabla,
        })
    }

    /// Like [`PartitionParams::key`], but a missing device selects every
    /// cached device.
    pub fn scope(&self, defaults: &DefaultsConfig) -> QueryResult<Scope> {
        if non_empty(&self.device_code).is_some() {
            return self.key(defaults).map(Scope::Device);
        }
        Ok(Scope::AllDevices {
            project_id: component("project_id", &self.project_id, &defaults.project_id)?,
            tabla: component("tabla", &self.tabla, &defaults.tabla)?,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn component(field: &'static str, value: &Option<String>, default: &str) -> QueryResult<String> {
    let value = non_empty(value).unwrap_or(default);
    validate_component(field, value).map_err(|e| QueryError::new(field, e.to_string()))?;
    Ok(value.to_string())
}

/// Raw `/api/data` and `/download` parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataParams {
    pub project_id: Option<String>,
    pub device_code: Option<String>,
    pub tabla: Option<String>,
    pub mode: Option<String>,
    pub day: Option<String>,
    pub since: Option<String>,
    pub limite: Option<String>,
    pub offset: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub order: Option<String>,
    pub paginate: Option<String>,
}

/// A validated data read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataQuery {
    Day {
        scope: Scope,
        day: Day,
        since: Option<Timestamp>,
        kind: RowKind,
    },
    Page {
        key: PartitionKey,
        limit: usize,
        offset: usize,
        order: Order,
        kind: RowKind,
        /// Walk every following page too (downloads only).
        paginate: bool,
    },
}

impl DataParams {
    fn partition(&self) -> PartitionParams {
        PartitionParams {
            project_id: self.project_id.clone(),
            device_code: self.device_code.clone(),
            tabla: self.tabla.clone(),
        }
    }

    /// Validate for `/api/data`: `mode=day` selects a day read, anything
    /// else a page read.
    pub fn validate(&self, defaults: &DefaultsConfig) -> QueryResult<DataQuery> {
        let kind = match non_empty(&self.kind) {
            Some(kind) => kind.parse()?,
            None => RowKind::default(),
        };
        match non_empty(&self.mode) {
            Some("day") => self.day_query(defaults, kind),
            Some("page") | None => self.page_query(defaults, kind),
            Some(other) => Err(QueryError::new(
                "mode",
                format!("'{other}' is not one of 'day', 'page'"),
            )),
        }
    }

    /// Validate for `/download/{kind}.{ext}`: a `day` selects a day export,
    /// otherwise the page parameters apply.
    pub fn validate_download(
        &self,
        defaults: &DefaultsConfig,
        kind: RowKind,
    ) -> QueryResult<DataQuery> {
        if non_empty(&self.day).is_some() {
            self.day_query(defaults, kind)
        } else {
            self.page_query(defaults, kind)
        }
    }

    fn day_query(&self, defaults: &DefaultsConfig, kind: RowKind) -> QueryResult<DataQuery> {
        let day = non_empty(&self.day)
            .ok_or_else(|| QueryError::new("day", "required when mode=day"))?;
        Ok(DataQuery::Day {
            scope: self.partition().scope(defaults)?,
            day: parse_day(day)?,
            since: parse_since(non_empty(&self.since))?,
            kind,
        })
    }

    fn page_query(&self, defaults: &DefaultsConfig, kind: RowKind) -> QueryResult<DataQuery> {
        Ok(DataQuery::Page {
            key: self.partition().key(defaults)?,
            limit: parse_limit(non_empty(&self.limite))?,
            offset: parse_offset(non_empty(&self.offset))?,
            order: match non_empty(&self.order) {
                Some(order) => order
                    .parse()
                    .map_err(|e: String| QueryError::new("order", e))?,
                None => Order::default(),
            },
            kind,
            paginate: parse_flag("paginate", non_empty(&self.paginate))?,
        })
    }
}

pub fn parse_day(value: &str) -> QueryResult<Day> {
    value
        .parse()
        .map_err(|_| QueryError::new("day", format!("'{value}' is not a YYYY-MM-DD date")))
}

/// ISO-8601 date-time or integer epoch seconds.
pub fn parse_since(value: Option<&str>) -> QueryResult<Option<Timestamp>> {
    value
        .map(|v| {
            Timestamp::parse_query(v).map_err(|_| {
                QueryError::new(
                    "since",
                    format!("'{v}' is neither an ISO-8601 timestamp nor epoch seconds"),
                )
            })
        })
        .transpose()
}

pub fn parse_limit(value: Option<&str>) -> QueryResult<usize> {
    let Some(value) = value else {
        return Ok(DEFAULT_LIMIT);
    };
    match value.parse::<usize>() {
        Ok(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
        _ => Err(QueryError::new(
            "limite",
            format!("'{value}' must be an integer between 1 and {MAX_LIMIT}"),
        )),
    }
}

pub fn parse_offset(value: Option<&str>) -> QueryResult<usize> {
    value.map_or(Ok(0), |v| {
        v.parse::<usize>()
            .map_err(|_| QueryError::new("offset", format!("'{v}' must be a non-negative integer")))
    })
}

/// `1`/`true` or `0`/`false`; absent means false.
pub fn parse_flag(field: &'static str, value: Option<&str>) -> QueryResult<bool> {
    match value {
        None | Some("0") | Some("false") => Ok(false),
        Some("1") | Some("true") => Ok(true),
        Some(other) => Err(QueryError::new(
            field,
            format!("'{other}' must be 0, 1, true or false"),
        )),
    }
}

/// Number of log lines; values above the buffer maximum are capped.
pub fn parse_tail(value: Option<&str>) -> QueryResult<usize> {
    let Some(value) = value else {
        return Ok(DEFAULT_TAIL);
    };
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n.min(MAX_LOG_TAIL)),
        _ => Err(QueryError::new(
            "tail",
            format!("'{value}' must be a positive integer"),
        )),
    }
}

/// Response of `/api/day-index`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayIndexView {
    pub days: Vec<Day>,
    /// Newest stored timestamp, if any.
    pub cursor: Option<Timestamp>,
}

/// Days and high-water mark of one partition, or the union over devices.
pub fn day_index(store: &DayStore, scope: &Scope) -> hiri_store::Result<DayIndexView> {
    let mut days = BTreeSet::new();
    let mut cursor = None;
    for key in scope.keys(store)? {
        let index = store.day_index(&key)?;
        days.extend(index.days());
        cursor = cursor.max(index.high_water());
    }
    Ok(DayIndexView {
        days: days.into_iter().collect(),
        cursor,
    })
}

/// Execute a validated read.
pub fn read(store: &DayStore, query: &DataQuery) -> hiri_store::Result<Vec<Reading>> {
    match query {
        DataQuery::Day {
            scope,
            day,
            since,
            kind,
        } => {
            let mut rows = Vec::new();
            for key in scope.keys(store)? {
                let mut day_rows = store.read_day(&key, *day, *since)?;
                for row in &mut day_rows {
                    if row.device_code.is_empty() {
                        row.device_code = key.device_code.clone();
                    }
                }
                rows.extend(day_rows);
            }
            if scope.is_aggregate() {
                rows.sort_by_key(|r| r.time);
            }
            kind.apply(&mut rows);
            Ok(rows)
        }
        DataQuery::Page {
            key,
            limit,
            offset,
            order,
            kind,
            paginate,
        } => {
            let mut rows = store.read_page(key, *limit, *offset, *order)?;
            if *paginate {
                let mut next = *offset + rows.len();
                loop {
                    let page = store.read_page(key, *limit, next, *order)?;
                    if page.is_empty() {
                        break;
                    }
                    next += page.len();
                    rows.extend(page);
                }
            }
            kind.apply(&mut rows);
            Ok(rows)
        }
    }
}
