use std::collections::HashMap;

use actix_web::http::header::HeaderMap;
use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder, Scope};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::Error;
use crate::model::{MessagePayload, PayloadHeaders, Status};
use crate::service::Service;

const NOT_BEFORE: &str = "done-not-before";
const DELAY: &str = "done-delay";
const FORWARD_PREFIX: &str = "done-forward-";
const COMMAND_PREFIX: &str = "done-";

#[derive(Serialize)]
struct SubmitResponse {
    id: String,
    publish_at: DateTime<Utc>,
}

fn invalid_header(name: &str, message: impl Into<String>) -> Error {
    Error::InvalidHeader {
        header: name.to_owned(),
        message: message.into(),
    }
}

/// `<N><s|m|h|d>` relative delay.
fn parse_delay(raw: &str) -> Result<chrono::Duration, Error> {
    let raw = raw.trim();
    if raw.len() < 2 || !raw.is_ascii() {
        return Err(invalid_header(DELAY, "expected <N><s|m|h|d>"));
    }

    let (value, unit) = raw.split_at(raw.len() - 1);
    let n: i64 = value
        .parse()
        .map_err(|_| invalid_header(DELAY, "expected <N><s|m|h|d>"))?;
    if n < 0 {
        return Err(invalid_header(DELAY, "delay must not be negative"));
    }

    match unit {
        "s" => Ok(chrono::Duration::seconds(n)),
        "m" => Ok(chrono::Duration::minutes(n)),
        "h" => Ok(chrono::Duration::hours(n)),
        "d" => Ok(chrono::Duration::days(n)),
        other => Err(invalid_header(DELAY, format!("unknown unit {other:?}"))),
    }
}

/// Splits the `Done-*` request headers into forward entries, command entries
/// and the publish instant. `Done-Not-Before` wins over `Done-Delay`.
pub(crate) fn parse_ingress(
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<(PayloadHeaders, DateTime<Utc>), Error> {
    let mut forward = HashMap::new();
    let mut command = HashMap::new();
    let mut not_before = None;
    let mut delay = None;

    for (name, value) in headers {
        let name = name.as_str();
        if !name.starts_with(COMMAND_PREFIX) {
            continue;
        }

        let value = value
            .to_str()
            .map_err(|_| invalid_header(name, "value is not valid UTF-8"))?
            .to_owned();

        if name == NOT_BEFORE {
            let secs: i64 = value
                .parse()
                .map_err(|_| invalid_header(NOT_BEFORE, "expected unix seconds"))?;
            not_before = Some(
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| invalid_header(NOT_BEFORE, "out of range"))?,
            );
        } else if name == DELAY {
            delay = Some(parse_delay(&value)?);
        } else if let Some(fwd) = name.strip_prefix(FORWARD_PREFIX) {
            forward.insert(fwd.to_owned(), value);
        } else if let Some(cmd) = name.strip_prefix(COMMAND_PREFIX) {
            command.insert(cmd.to_owned(), value);
        }
    }

    let publish_at = not_before
        .or_else(|| delay.map(|d| now + d))
        .unwrap_or(now);

    Ok((PayloadHeaders { forward, command }, publish_at))
}

fn parse_target_url(tail: &str, query: &str) -> Result<String, Error> {
    let raw = if query.is_empty() {
        tail.to_owned()
    } else {
        format!("{tail}?{query}")
    };

    let parsed = reqwest::Url::parse(&raw).map_err(|e| Error::InvalidUrl {
        message: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl {
            message: format!("unsupported scheme {}", parsed.scheme()),
        });
    }

    Ok(parsed.to_string())
}

/// Enqueue a new message. The callback URL is the remaining request path.
#[post("/{target:.*}")]
async fn submit(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
    service: web::Data<Service>,
) -> Result<impl Responder, Error> {
    let url = parse_target_url(&path.into_inner(), req.query_string())?;
    let (headers, publish_at) = parse_ingress(req.headers(), Utc::now())?;

    let data = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body).map_err(|e| Error::InvalidBody {
                message: e.to_string(),
            })?,
        )
    };

    let payload = MessagePayload { headers, url, data };
    let (id, publish_at) = service.submit(payload, publish_at).await?;

    Ok(HttpResponse::Created().json(SubmitResponse { id, publish_at }))
}

#[get("/by-status/{status}")]
async fn list_by_status(
    path: web::Path<String>,
    service: web::Data<Service>,
) -> Result<impl Responder, Error> {
    let status: Status = path.into_inner().parse()?;
    let messages = service.list_by_status(status).await?;
    Ok(web::Json(messages))
}

#[get("/{id}")]
async fn fetch_one(
    path: web::Path<String>,
    service: web::Data<Service>,
) -> Result<impl Responder, Error> {
    let message = service.get_message(&path.into_inner()).await?;
    Ok(web::Json(message))
}

pub fn service() -> Scope {
    web::scope("/messages")
        .service(list_by_status)
        .service(fetch_one)
        .service(submit)
}
