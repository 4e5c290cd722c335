use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::{AllocationChange, NewAllocation, NewResource, ResourceChange};
use crate::model::*;

/// Parsed command from an HTTP request line, query string and body.
#[derive(Debug, Clone)]
pub enum Command {
    Availability {
        resource_id: Ulid,
        project_id: Option<Ulid>,
        range: DateRange,
        /// Zero asks for the availability report only.
        hours: Hours,
    },
    Booking {
        /// `None` falls back to the default window around `today`.
        range: Option<DateRange>,
        resource_id: Option<Ulid>,
        include_inactive: bool,
        today: Option<NaiveDate>,
    },
    ListResources,
    ListAllocations {
        resource_id: Ulid,
    },
    GetAllocation {
        id: Ulid,
    },
    ProjectSummary {
        project_id: Ulid,
        today: Option<NaiveDate>,
    },
    CreateResource(NewResource),
    UpdateResource {
        id: Ulid,
        change: ResourceChange,
    },
    DeleteResource {
        id: Ulid,
    },
    CreateProject {
        id: Option<Ulid>,
        name: Option<String>,
    },
    DeleteProject {
        id: Ulid,
    },
    CreateAllocation(NewAllocation),
    UpdateAllocation {
        id: Ulid,
        change: AllocationChange,
    },
    DeleteAllocation {
        id: Ulid,
    },
    RetireAllocation {
        id: Ulid,
    },
    ReinstateAllocation {
        id: Ulid,
    },
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Required parameters absent, in declaration order.
    Incomplete(Vec<&'static str>),
    InvalidDate { param: &'static str, value: String },
    InvalidHours { param: &'static str, value: String },
    InvalidId { param: &'static str, value: String },
    InvalidFlag { param: &'static str, value: String },
    InvalidBody(String),
    UnknownRoute { method: String, path: String },
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Incomplete(missing) => {
                write!(f, "missing required parameters: {}", missing.join(", "))
            }
            QueryError::InvalidDate { param, value } => {
                write!(f, "{param}: {value:?} is not a YYYY-MM-DD date")
            }
            QueryError::InvalidHours { param, value } => {
                write!(f, "{param}: {value:?} is not a non-negative decimal with at most 2 places")
            }
            QueryError::InvalidId { param, value } => write!(f, "{param}: {value:?} is not a ULID"),
            QueryError::InvalidFlag { param, value } => {
                write!(f, "{param}: {value:?} is not a boolean")
            }
            QueryError::InvalidBody(e) => write!(f, "invalid JSON body: {e}"),
            QueryError::UnknownRoute { method, path } => write!(f, "no route for {method} {path}"),
        }
    }
}

impl std::error::Error for QueryError {}

// ── Query strings ─────────────────────────────────────────────

/// Decode `%XX` escapes and `+`. Malformed escapes are kept literally.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decoded `key=value` pairs. Later duplicates win; empty values count as absent.
#[derive(Debug, Default)]
pub struct Params(HashMap<String, String>);

impl Params {
    pub fn parse(query: &str) -> Self {
        let mut map = HashMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let v = percent_decode(v);
            if !v.trim().is_empty() {
                map.insert(percent_decode(k), v);
            }
        }
        Params(map)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim())
    }

    /// Fail with every missing name at once, not just the first.
    fn require(&self, keys: &[&'static str]) -> Result<(), QueryError> {
        let missing: Vec<&'static str> =
            keys.iter().copied().filter(|k| self.get(k).is_none()).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(QueryError::Incomplete(missing))
        }
    }

    fn date(&self, key: &'static str) -> Result<Option<NaiveDate>, QueryError> {
        self.get(key)
            .map(|v| {
                NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|_| QueryError::InvalidDate {
                    param: key,
                    value: v.to_string(),
                })
            })
            .transpose()
    }

    fn id(&self, key: &'static str) -> Result<Option<Ulid>, QueryError> {
        self.get(key).map(|v| parse_id(key, v)).transpose()
    }

    fn hours(&self, key: &'static str) -> Result<Option<Hours>, QueryError> {
        self.get(key)
            .map(|v| match Hours::parse(v) {
                Ok(h) if h >= Hours::ZERO => Ok(h),
                _ => Err(QueryError::InvalidHours {
                    param: key,
                    value: v.to_string(),
                }),
            })
            .transpose()
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, QueryError> {
        self.get(key)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(QueryError::InvalidFlag {
                    param: key,
                    value: v.to_string(),
                }),
            })
            .transpose()
    }

    /// `start` and `end` together; both required.
    fn range(&self) -> Result<DateRange, QueryError> {
        match (self.date("start")?, self.date("end")?) {
            (Some(start), Some(end)) => Ok(DateRange::new(start, end)),
            _ => Err(QueryError::Incomplete(
                ["start", "end"].into_iter().filter(|k| self.get(k).is_none()).collect(),
            )),
        }
    }
}

fn parse_id(param: &'static str, value: &str) -> Result<Ulid, QueryError> {
    Ulid::from_string(value).map_err(|_| QueryError::InvalidId {
        param,
        value: value.to_string(),
    })
}

// ── JSON bodies ───────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceBody {
    id: Option<Ulid>,
    name: Option<String>,
    capacity_weekly: Option<Hours>,
    availability_percentage: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceChangeBody {
    name: Option<String>,
    capacity_weekly: Option<Hours>,
    availability_percentage: Option<u8>,
    is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectBody {
    id: Option<Ulid>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AllocationBody {
    id: Option<Ulid>,
    resource: Ulid,
    project: Ulid,
    start: NaiveDate,
    end: NaiveDate,
    hours_per_week: Hours,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AllocationChangeBody {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    hours_per_week: Option<Hours>,
    notes: Option<String>,
}

/// An empty body reads as `{}`.
fn json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, QueryError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| QueryError::InvalidBody(e.to_string()))
}

// ── Routing ───────────────────────────────────────────────────

pub fn parse_request(
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
) -> Result<Command, QueryError> {
    let params = Params::parse(query);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("GET", ["availability"]) => {
            params.require(&["resource", "start", "end"])?;
            let resource_id = params
                .id("resource")?
                .ok_or(QueryError::Incomplete(vec!["resource"]))?;
            Ok(Command::Availability {
                resource_id,
                project_id: params.id("project")?,
                range: params.range()?,
                hours: params.hours("hours")?.unwrap_or(Hours::ZERO),
            })
        }
        ("GET", ["booking"]) => {
            let range = if params.get("start").is_none() && params.get("end").is_none() {
                None
            } else {
                Some(params.range()?)
            };
            Ok(Command::Booking {
                range,
                resource_id: params.id("resource")?,
                include_inactive: params.flag("include_inactive")?.unwrap_or(false),
                today: params.date("today")?,
            })
        }
        ("GET", ["resources"]) => Ok(Command::ListResources),
        ("GET", ["resources", id, "allocations"]) => Ok(Command::ListAllocations {
            resource_id: parse_id("resource", id)?,
        }),
        ("GET", ["allocations", id]) => Ok(Command::GetAllocation {
            id: parse_id("allocation", id)?,
        }),
        ("GET", ["projects", id, "summary"]) => Ok(Command::ProjectSummary {
            project_id: parse_id("project", id)?,
            today: params.date("today")?,
        }),

        ("POST", ["resources"]) => {
            let b: ResourceBody = json(body)?;
            Ok(Command::CreateResource(NewResource {
                id: b.id,
                name: b.name,
                capacity_weekly: b.capacity_weekly,
                availability_percentage: b.availability_percentage,
            }))
        }
        ("PUT", ["resources", id]) => {
            let id = parse_id("resource", id)?;
            let b: ResourceChangeBody = json(body)?;
            Ok(Command::UpdateResource {
                id,
                change: ResourceChange {
                    name: b.name,
                    capacity_weekly: b.capacity_weekly,
                    availability_percentage: b.availability_percentage,
                    is_active: b.is_active,
                },
            })
        }
        ("DELETE", ["resources", id]) => Ok(Command::DeleteResource {
            id: parse_id("resource", id)?,
        }),

        ("POST", ["projects"]) => {
            let b: ProjectBody = json(body)?;
            Ok(Command::CreateProject { id: b.id, name: b.name })
        }
        ("DELETE", ["projects", id]) => Ok(Command::DeleteProject {
            id: parse_id("project", id)?,
        }),

        ("POST", ["allocations"]) => {
            let b: AllocationBody = json(body)?;
            Ok(Command::CreateAllocation(NewAllocation {
                id: b.id,
                resource_id: b.resource,
                project_id: b.project,
                range: DateRange::new(b.start, b.end),
                hours_per_week: b.hours_per_week,
                notes: b.notes,
            }))
        }
        ("PUT", ["allocations", id]) => {
            let id = parse_id("allocation", id)?;
            let b: AllocationChangeBody = json(body)?;
            Ok(Command::UpdateAllocation {
                id,
                change: AllocationChange {
                    start: b.start,
                    end: b.end,
                    hours_per_week: b.hours_per_week,
                    notes: b.notes,
                },
            })
        }
        ("DELETE", ["allocations", id]) => Ok(Command::DeleteAllocation {
            id: parse_id("allocation", id)?,
        }),
        ("POST", ["allocations", id, "retire"]) => Ok(Command::RetireAllocation {
            id: parse_id("allocation", id)?,
        }),
        ("POST", ["allocations", id, "reinstate"]) => Ok(Command::ReinstateAllocation {
            id: parse_id("allocation", id)?,
        }),

        _ => Err(QueryError::UnknownRoute {
            method: method.to_string(),
            path: path.to_string(),
        }),
    }
}
