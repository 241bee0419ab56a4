#[macro_use]
extern crate rocket;

pub mod api;
pub mod cache;
pub mod config;
pub mod images;
pub mod jobs;
pub mod service;

use rocket::{figment::Figment, Build, Rocket};

use config::AppConfig;
use service::ResizeService;

/// Assemble the HTTP service around an already constructed [`ResizeService`].
pub fn build_rocket(figment: Figment, service: ResizeService, config: AppConfig) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(service)
        .manage(config)
        .mount("/", routes![api::resize::health])
        .mount(
            "/v1",
            routes![
                api::resize::resize,
                api::resize::resize_get,
                api::resize::resize_put,
                api::resize::resize_delete,
                api::resize::resize_patch,
                api::resize::get_image,
            ],
        )
}
