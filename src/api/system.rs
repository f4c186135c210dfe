use actix_web::{get, web, Responder, Scope};
use chrono::Utc;

#[get("/ping")]
async fn ping() -> impl Responder {
    "pong"
}

#[get("/health")]
async fn health() -> impl Responder {
    web::Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

pub fn service() -> Scope {
    web::scope("/system").service(ping).service(health)
}
