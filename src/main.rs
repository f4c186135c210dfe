use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use done_light::api;
use done_light::auth::BearerAuth;
use done_light::config::Config;
use done_light::service::Service;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DONE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DONE_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    let token = config.auth_token_or_generate();
    let bind_addr = config.bind_addr().to_owned();

    let service = Service::connect_with(config).await?;
    service.spawn_workers();

    let data = web::Data::new(service.clone());

    tracing::info!(%bind_addr, "listening");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_header()
            .allow_any_method();

        App::new()
            .wrap(TracingLogger::default())
            .wrap(cors)
            .service(
                web::scope("/v1")
                    .wrap(BearerAuth::new(token.clone()))
                    .service(api::messages::service())
                    .service(api::admin::service())
                    .service(api::system::service()),
            )
            .app_data(data.clone())
    })
    .bind(bind_addr)?
    .run()
    .await?;

    service.shutdown();

    Ok(())
}
