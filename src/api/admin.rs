use actix_web::{delete, get, web, Responder, Scope};

use crate::error::Error;
use crate::service::Service;

const LOG_PAGE: u32 = 100;

#[get("/stats")]
async fn stats(service: web::Data<Service>) -> Result<impl Responder, Error> {
    Ok(web::Json(service.stats_snapshot().await?))
}

#[get("/raw")]
async fn raw_all(service: web::Data<Service>) -> Result<impl Responder, Error> {
    Ok(web::Json(service.raw(None).await?))
}

#[get("/raw/{match}")]
async fn raw_one(
    path: web::Path<String>,
    service: web::Data<Service>,
) -> Result<impl Responder, Error> {
    Ok(web::Json(service.raw(Some(&path.into_inner())).await?))
}

#[get("/logs")]
async fn recent_logs(service: web::Data<Service>) -> Result<impl Responder, Error> {
    Ok(web::Json(service.recent_logs(LOG_PAGE).await?))
}

#[get("/log/{message_id}")]
async fn message_logs(
    path: web::Path<String>,
    service: web::Data<Service>,
) -> Result<impl Responder, Error> {
    Ok(web::Json(service.message_logs(&path.into_inner()).await?))
}

#[delete("/reset")]
async fn reset_all(service: web::Data<Service>) -> Result<impl Responder, Error> {
    service.reset(None).await?;
    Ok("OK")
}

#[delete("/reset/{match}")]
async fn reset_one(
    path: web::Path<String>,
    service: web::Data<Service>,
) -> Result<impl Responder, Error> {
    service.reset(Some(&path.into_inner())).await?;
    Ok("OK")
}

pub fn service() -> Scope {
    web::scope("/admin")
        .service(stats)
        .service(raw_all)
        .service(raw_one)
        .service(recent_logs)
        .service(message_logs)
        .service(reset_all)
        .service(reset_one)
}
