use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::engine::{default_booking_window, Engine, EngineError};
use crate::limits::*;
use crate::observability;
use crate::query::{self, Command, QueryError};

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    /// JSON text.
    pub body: String,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Response { status, body },
            Err(e) => {
                tracing::error!("response serialization failed: {e}");
                Response {
                    status: 500,
                    body: r#"{"error":"internal_error"}"#.to_string(),
                }
            }
        }
    }

    fn error(status: u16, code: &str, message: impl std::fmt::Display) -> Self {
        Self::json(status, &json!({ "error": code, "message": message.to_string() }))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            reason_phrase(self.status),
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(self.body.as_bytes());
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        431 => "Request Header Fields Too Large",
        _ => "Internal Server Error",
    }
}

// ── Request framing ──────────────────────────────────────────

#[derive(Debug)]
pub enum HttpError {
    Io(std::io::Error),
    Malformed(&'static str),
    LineTooLong,
    TooManyHeaders,
    BodyTooLarge(usize),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Io(e) => write!(f, "I/O error: {e}"),
            HttpError::Malformed(what) => write!(f, "malformed request: {what}"),
            HttpError::LineTooLong => write!(f, "request line or header too long"),
            HttpError::TooManyHeaders => write!(f, "too many headers"),
            HttpError::BodyTooLarge(len) => write!(f, "body of {len} bytes exceeds limit"),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<LinesCodecError> for HttpError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => HttpError::LineTooLong,
            // The codec reports a line that is not UTF-8 as InvalidData.
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                HttpError::Malformed("request is not UTF-8")
            }
            LinesCodecError::Io(e) => HttpError::Io(e),
        }
    }
}

impl HttpError {
    /// The reply for a request that could not be framed.
    fn response(&self) -> Response {
        match self {
            HttpError::Io(_) | HttpError::Malformed(_) => Response::error(400, "bad_request", self),
            HttpError::LineTooLong | HttpError::TooManyHeaders => {
                Response::error(431, "headers_too_large", self)
            }
            HttpError::BodyTooLarge(_) => Response::error(413, "limit_exceeded", self),
        }
    }
}

/// Read one request. `Ok(None)` when the peer closed before sending anything.
pub async fn read_request<R: AsyncRead + Unpin>(reader: R) -> Result<Option<Request>, HttpError> {
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_LINE_LEN));

    let Some(request_line) = lines.next().await.transpose()? else {
        return Ok(None);
    };
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::Malformed("request line"));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Malformed("unsupported HTTP version"));
    }
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let mut headers = Vec::new();
    loop {
        let line = lines
            .next()
            .await
            .transpose()?
            .ok_or(HttpError::Malformed("headers ended early"))?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(HttpError::TooManyHeaders);
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::Malformed("header without colon"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut request = Request {
        method: method.to_string(),
        path: path.to_string(),
        query: query.to_string(),
        headers,
        body: Vec::new(),
    };

    let content_length = match request.header("content-length") {
        None => 0,
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| HttpError::Malformed("content-length"))?,
    };
    if content_length > MAX_REQUEST_BODY_LEN {
        return Err(HttpError::BodyTooLarge(content_length));
    }
    if content_length > 0 {
        // The codec may already hold the start of the body.
        let mut body = lines.read_buffer().to_vec();
        body.truncate(content_length);
        let already = body.len();
        body.resize(content_length, 0);
        let mut reader = lines.into_inner();
        reader
            .read_exact(&mut body[already..])
            .await
            .map_err(HttpError::Io)?;
        request.body = body;
    }
    Ok(Some(request))
}

/// Serve a single request on `socket`, then close it.
pub async fn process_connection(mut socket: TcpStream, engine: Arc<Engine>) -> std::io::Result<()> {
    let (reader, mut writer) = socket.split();
    let response = match read_request(reader).await {
        Ok(Some(request)) => handle(&engine, &request).await,
        Ok(None) => return Ok(()),
        Err(HttpError::Io(e)) => return Err(e),
        Err(e) => {
            debug!("rejecting request: {e}");
            e.response()
        }
    };
    writer.write_all(&response.to_bytes()).await?;
    writer.shutdown().await
}

// ── Routing ──────────────────────────────────────────────────

/// Route, execute and encode one request. Never fails: every error becomes a
/// status code with a JSON error body.
pub async fn handle(engine: &Engine, request: &Request) -> Response {
    let route = observability::route_label(&request.method, &request.path);
    let start = Instant::now();

    let parsed =
        query::parse_request(&request.method, &request.path, &request.query, &request.body);
    let response = match parsed {
        Ok(cmd) => execute(engine, cmd).await.unwrap_or_else(|e| engine_error_response(&e)),
        Err(e) => query_error_response(&e),
    };

    let status = response.status.to_string();
    metrics::counter!(observability::REQUESTS_TOTAL, "route" => route, "status" => status)
        .increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    debug!("{} {} -> {}", request.method, request.path, response.status);
    response
}

async fn execute(engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
    let today = || chrono::Utc::now().date_naive();
    Ok(match cmd {
        Command::Availability {
            resource_id,
            project_id,
            range,
            hours,
        } => {
            let rec = engine.recommend(resource_id, project_id, range, hours).await?;
            Response::json(200, &rec)
        }
        Command::Booking {
            range,
            resource_id,
            include_inactive,
            today: day,
        } => {
            let day = day.unwrap_or_else(today);
            let range = range.unwrap_or_else(|| default_booking_window(day));
            let report = engine
                .booking_report(range, resource_id, include_inactive, day)
                .await?;
            Response::json(200, &report)
        }
        Command::ListResources => Response::json(200, &engine.list_resources().await),
        Command::ListAllocations { resource_id } => {
            Response::json(200, &engine.list_allocations(resource_id).await?)
        }
        Command::GetAllocation { id } => Response::json(200, &engine.get_allocation(id).await?),
        Command::ProjectSummary { project_id, today: day } => {
            let summary = engine.project_summary(project_id, day.unwrap_or_else(today)).await?;
            Response::json(200, &summary)
        }
        Command::CreateResource(new) => Response::json(201, &engine.create_resource(new).await?),
        Command::UpdateResource { id, change } => {
            Response::json(200, &engine.update_resource(id, change).await?)
        }
        Command::DeleteResource { id } => {
            engine.delete_resource(id).await?;
            Response::json(200, &json!({ "deleted": id }))
        }
        Command::CreateProject { id, name } => {
            Response::json(201, &engine.create_project(id, name).await?)
        }
        Command::DeleteProject { id } => {
            let removed = engine.delete_project(id).await?;
            Response::json(200, &json!({ "deleted": id, "allocations_removed": removed }))
        }
        Command::CreateAllocation(new) => {
            Response::json(201, &engine.create_allocation(new).await?)
        }
        Command::UpdateAllocation { id, change } => {
            Response::json(200, &engine.update_allocation(id, change).await?)
        }
        Command::DeleteAllocation { id } => {
            let resource_id = engine.remove_allocation(id).await?;
            Response::json(200, &json!({ "deleted": id, "resource_id": resource_id }))
        }
        Command::RetireAllocation { id } => {
            Response::json(200, &engine.retire_allocation(id).await?)
        }
        Command::ReinstateAllocation { id } => {
            Response::json(200, &engine.reinstate_allocation(id).await?)
        }
    })
}

fn engine_error_response(e: &EngineError) -> Response {
    match e {
        EngineError::Validation(_) => Response::error(422, "validation_error", e),
        EngineError::CapacityExceeded(detail) => Response::json(
            409,
            &json!({
                "error": "capacity_exceeded",
                "message": e.to_string(),
                "detail": detail,
            }),
        ),
        EngineError::ResourceNotFound(_) => Response::error(404, "resource_not_found", e),
        EngineError::ProjectNotFound(_) => Response::error(404, "project_not_found", e),
        EngineError::AllocationNotFound(_) => Response::error(404, "allocation_not_found", e),
        EngineError::AlreadyExists(_) => Response::error(409, "already_exists", e),
        EngineError::LimitExceeded(_) => Response::error(413, "limit_exceeded", e),
        EngineError::WalError(_) => {
            tracing::error!("request failed: {e}");
            Response::error(500, "internal_error", "write could not be persisted")
        }
    }
}

fn query_error_response(e: &QueryError) -> Response {
    match e {
        QueryError::Incomplete(missing) => Response::json(
            400,
            &json!({
                "error": "incomplete_parameters",
                "message": e.to_string(),
                "missing": missing,
            }),
        ),
        QueryError::UnknownRoute { .. } => Response::error(404, "not_found", e),
        QueryError::InvalidDate { param, .. }
        | QueryError::InvalidHours { param, .. }
        | QueryError::InvalidId { param, .. }
        | QueryError::InvalidFlag { param, .. } => Response::json(
            400,
            &json!({
                "error": "invalid_parameter",
                "message": e.to_string(),
                "param": param,
            }),
        ),
        QueryError::InvalidBody(_) => Response::error(400, "invalid_parameter", e),
    }
}
