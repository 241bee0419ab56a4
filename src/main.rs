use std::env;
use std::error::Error;

use dotenv::dotenv;
use env_logger::Env;
use log::{error, info};
use rocket::{
    figment::{
        providers::{Format, Toml},
        Figment, Profile,
    },
    Config,
};

use resizn::build_rocket;
use resizn::config::AppConfig;
use resizn::service::ResizeService;

#[rocket::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    // Load config
    let mut figment = Figment::from(Config::default())
        .merge(Toml::file("App.toml").nested());

    if let Ok(public_url) = env::var("PUBLIC_URL") {
        figment = figment.merge(("public_url", public_url));
    }

    if let Ok(capacity) = env::var("CACHE_CAPACITY") {
        match capacity.trim().parse::<usize>() {
            Ok(capacity) => figment = figment.merge(("cache_capacity", capacity)),
            Err(e) => error!("Ignoring invalid CACHE_CAPACITY '{}': {}", capacity, e),
        }
    }

    figment = figment.select(Profile::from_env_or("APP_PROFILE", "default"));

    let config = figment.extract::<AppConfig>()?;
    info!("Configuration loaded successfully");

    // JSON bodies are tiny, reject anything bigger before parsing
    figment = figment.merge(("limits.json", config.request_body_limit));

    let service = ResizeService::from_config(&config)?;
    info!(
        "Resize service initialized (cache capacity {}, fetch timeout {}s, wait timeout {}s)",
        config.cache_capacity, config.fetch_timeout, config.wait_timeout
    );

    info!(
        "Starting Resizn API server on {}:{}",
        config.address, config.port
    );

    build_rocket(figment, service, config).launch().await?;

    Ok(())
}
